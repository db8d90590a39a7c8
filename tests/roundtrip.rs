//! End-to-end write/read scenarios over real files.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use ometiff::meta::MetadataStore;
use ometiff::pixel::VariantPixelBuffer;
use ometiff::tags::{PlanarConfiguration, SubfileType, Tag};
use ometiff::tiff::{ChunkLayout, Tiff, TiffSink};
use ometiff::{
    DimensionOrder, OmeTiffError, OmeTiffReader, OmeTiffWriter, OmeXmlMetadata, PixelType,
    UsageError,
};

fn extents(w: usize, h: usize, s: usize) -> [usize; 9] {
    [w, h, 1, s, 1, 1, 1, 1, 1]
}

/// A dataset description: per series `(x, y, z, c, t)` of `pixel_type`.
fn simple_meta(series: &[(u32, u32, u32, u32, u32)], pixel_type: PixelType) -> OmeXmlMetadata {
    let mut meta = OmeXmlMetadata::new();
    for (i, (x, y, z, c, t)) in series.iter().enumerate() {
        meta.set_pixels_size_x(*x, i);
        meta.set_pixels_size_y(*y, i);
        meta.set_pixels_size_z(*z, i);
        meta.set_pixels_size_c(*c, i);
        meta.set_pixels_size_t(*t, i);
        meta.set_pixels_type(pixel_type, i);
        meta.set_pixels_dimension_order(DimensionOrder::XYZCT, i);
        meta.set_pixels_big_endian(false, i);
        meta.set_pixels_interleaved(true, i);
        for channel in 0..*c as usize {
            meta.set_channel_samples_per_pixel(1, i, channel);
        }
    }
    meta
}

fn gradient_plane(w: usize, h: usize, seed: u8) -> VariantPixelBuffer<'static> {
    let mut buf = VariantPixelBuffer::new(PixelType::UInt8, extents(w, h, 1));
    for (i, value) in buf.data_mut::<u8>().unwrap().iter_mut().enumerate() {
        *value = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    buf
}

#[test]
fn s1_two_timepoints_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.ome.tif");

    let plane0 = gradient_plane(16, 16, 1);
    let plane1 = gradient_plane(16, 16, 2);

    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(16, 16, 1, 1, 2)], PixelType::UInt8)))
        .unwrap();
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &plane0).unwrap();
    writer.save_bytes(1, &plane1).unwrap();
    writer.close().unwrap();

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    assert_eq!(reader.series_count(), 1);
    reader.set_series(0).unwrap();
    assert_eq!(reader.image_count().unwrap(), 2);
    assert_eq!(reader.size_x().unwrap(), 16);
    assert_eq!(reader.size_t().unwrap(), 2);
    assert_eq!(reader.pixel_type().unwrap(), PixelType::UInt8);
    assert_eq!(reader.dimension_order().unwrap(), DimensionOrder::XYZCT);

    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, plane0);
    reader.open_bytes(1, &mut readback).unwrap();
    assert_eq!(readback, plane1);
}

#[test]
fn s2_two_series_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.ome.tif");

    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(
            &[(8, 8, 1, 1, 1), (8, 8, 1, 1, 1)],
            PixelType::UInt8,
        )))
        .unwrap();
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &gradient_plane(8, 8, 3)).unwrap();
    writer.set_series(1).unwrap();
    writer.save_bytes(0, &gradient_plane(8, 8, 4)).unwrap();
    writer.close().unwrap();

    let tiff = Tiff::open(&path).unwrap();
    assert_eq!(tiff.directory_count(), 2);
    drop(tiff);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    assert_eq!(reader.series_count(), 2);

    let store = reader.metadata_store();
    use ometiff::MetadataRetrieve;
    assert_eq!(store.tiff_data_ifd(0, 0).unwrap(), 0);
    assert_eq!(store.tiff_data_ifd(1, 0).unwrap(), 1);
    assert_eq!(store.uuid_file_name(0, 0).unwrap(), "s2.ome.tif");
    assert_eq!(store.uuid_file_name(1, 0).unwrap(), "s2.ome.tif");

    reader.set_series(0).unwrap();
    let planes0 = reader.planes().unwrap().to_vec();
    reader.set_series(1).unwrap();
    let planes1 = reader.planes().unwrap().to_vec();
    assert_eq!(planes0[0].ifd, 0);
    assert_eq!(planes1[0].ifd, 1);
}

#[test]
fn s3_pyramid_sub_resolutions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.ome.tif");

    let mut meta = simple_meta(&[(1024, 1024, 1, 1, 1)], PixelType::UInt8);
    meta.set_resolutions(
        &[
            ometiff::Resolution {
                size_x: 512,
                size_y: 512,
                size_z: 1,
            },
            ometiff::Resolution {
                size_x: 256,
                size_y: 256,
                size_z: 1,
            },
        ],
        0,
    );

    let mut writer = OmeTiffWriter::new();
    writer.set_metadata_retrieve(Box::new(meta)).unwrap();
    writer.set_tile_size_x(Some(256));
    writer.set_tile_size_y(Some(256));
    writer.set_id(&path).unwrap();

    assert_eq!(writer.resolution_count().unwrap(), 3);
    for resolution in 0..3 {
        writer.set_resolution(resolution).unwrap();
        let size = writer.size_x().unwrap() as usize;
        writer
            .save_bytes(0, &gradient_plane(size, size, resolution as u8))
            .unwrap();
    }
    writer.close().unwrap();

    // One main-chain IFD whose SubIFD field points at two reduced rasters.
    let mut tiff = Tiff::open(&path).unwrap();
    assert_eq!(tiff.directory_count(), 1);
    let first = tiff.directory(0).unwrap();
    let subifds = first.sub_ifd_offsets().unwrap().unwrap();
    assert_eq!(subifds.len(), 2);
    assert_eq!(
        first.u32_field(Tag::NewSubfileType).unwrap(),
        SubfileType::PAGE.0
    );
    for offset in &subifds {
        let sub = tiff.directory_at(*offset).unwrap();
        assert_eq!(
            sub.u32_field(Tag::NewSubfileType).unwrap(),
            (SubfileType::PAGE | SubfileType::REDUCED_IMAGE).0
        );
        assert_eq!(
            sub.chunk_layout().unwrap(),
            ChunkLayout::Tiles {
                width: 256,
                height: 256
            }
        );
    }
    drop(tiff);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    assert_eq!(reader.resolution_count().unwrap(), 3);
    let mut sizes = Vec::new();
    for resolution in 0..3 {
        reader.set_resolution(resolution).unwrap();
        sizes.push((reader.size_x().unwrap(), reader.size_y().unwrap()));
        assert_eq!(reader.size_z().unwrap(), 1);
        assert_eq!(reader.pixel_type().unwrap(), PixelType::UInt8);
    }
    assert_eq!(sizes, vec![(1024, 1024), (512, 512), (256, 256)]);

    // Sub-resolution pixel data reads back through the SubIFD indirection.
    reader.set_resolution(2).unwrap();
    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, gradient_plane(256, 256, 2));
}

#[test]
fn s4_multi_file_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.ome.tif");
    let path_b = dir.path().join("b.ome.tif");

    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(8, 8, 1, 1, 2)], PixelType::UInt8)))
        .unwrap();
    writer.set_id(&path_a).unwrap();
    writer.save_bytes(0, &gradient_plane(8, 8, 5)).unwrap();
    writer.set_plane(1).unwrap();
    writer.change_output_file(&path_b).unwrap();
    writer.save_bytes(1, &gradient_plane(8, 8, 6)).unwrap();
    writer.close().unwrap();

    for entry in [&path_a, &path_b] {
        let mut reader = OmeTiffReader::new();
        reader.set_id(entry).unwrap();
        assert_eq!(reader.series_count(), 1);
        reader.set_series(0).unwrap();
        assert_eq!(reader.image_count().unwrap(), 2);

        let planes = reader.planes().unwrap().to_vec();
        let file0 = planes[0].id.clone().unwrap();
        let file1 = planes[1].id.clone().unwrap();
        assert_ne!(file0, file1);
        assert_eq!(file0, std::fs::canonicalize(&path_a).unwrap());
        assert_eq!(file1, std::fs::canonicalize(&path_b).unwrap());

        let used = reader.used_files().unwrap();
        assert_eq!(used.len(), 2);

        let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
        reader.open_bytes(0, &mut readback).unwrap();
        assert_eq!(readback, gradient_plane(8, 8, 5));
        reader.open_bytes(1, &mut readback).unwrap();
        assert_eq!(readback, gradient_plane(8, 8, 6));
    }
}

#[test]
fn s5_non_ascii_image_description_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.ome.tif");

    // Minimal little-endian classic TIFF whose single IFD carries an
    // ImageDescription of type BYTE.
    let mut bytes: Vec<u8> = Vec::new();
    bytes.extend_from_slice(b"II");
    bytes.extend_from_slice(&42u16.to_le_bytes());
    bytes.extend_from_slice(&8u32.to_le_bytes()); // first IFD offset
    bytes.extend_from_slice(&1u16.to_le_bytes()); // one entry
    bytes.extend_from_slice(&270u16.to_le_bytes()); // ImageDescription
    bytes.extend_from_slice(&1u16.to_le_bytes()); // BYTE
    bytes.extend_from_slice(&4u32.to_le_bytes()); // count
    bytes.extend_from_slice(b"<x/>"); // inline value
    bytes.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
    std::fs::write(&path, bytes).unwrap();

    let mut reader = OmeTiffReader::new();
    let err = reader.set_id(&path).unwrap_err();
    assert!(matches!(
        err,
        OmeTiffError::FormatError(ometiff::FormatError::ImageDescriptionNotAscii(_))
    ));
}

#[test]
fn s6_incomplete_planes_refuse_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.ome.tif");

    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(8, 8, 1, 1, 4)], PixelType::UInt8)))
        .unwrap();
    writer.set_id(&path).unwrap();
    for plane in 0..3 {
        writer
            .save_bytes(plane, &gradient_plane(8, 8, plane as u8))
            .unwrap();
    }
    let err = writer.close().unwrap_err();
    assert!(matches!(
        err,
        OmeTiffError::UsageError(UsageError::IncompletePlanes(1))
    ));
}

/// The post-close patch invariant: the first IFD's `ImageDescription` has
/// ASCII type, count `len(xml)+1`, and points at a `<`-led, NUL-terminated
/// region.
#[test]
fn patched_image_description_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patched.ome.tif");

    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(8, 8, 1, 1, 1)], PixelType::UInt8)))
        .unwrap();
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &gradient_plane(8, 8, 9)).unwrap();
    writer.close().unwrap();

    let mut file = std::fs::File::open(&path).unwrap();
    let mut header = [0u8; 8];
    file.read_exact(&mut header).unwrap();
    let le = &header[..2] == b"II";
    let read_u16 = |b: [u8; 2]| if le { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) };
    let read_u32 = |b: [u8; 4]| if le { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) };
    assert_eq!(read_u16([header[2], header[3]]), 42);

    let ifd0 = read_u32([header[4], header[5], header[6], header[7]]) as u64;
    file.seek(SeekFrom::Start(ifd0)).unwrap();
    let mut count_bytes = [0u8; 2];
    file.read_exact(&mut count_bytes).unwrap();
    let entries = read_u16(count_bytes);

    let mut found = false;
    for i in 0..entries as u64 {
        file.seek(SeekFrom::Start(ifd0 + 2 + i * 12)).unwrap();
        let mut entry = [0u8; 12];
        file.read_exact(&mut entry).unwrap();
        if read_u16([entry[0], entry[1]]) != 270 {
            continue;
        }
        found = true;
        assert_eq!(read_u16([entry[2], entry[3]]), 2, "type must be ASCII");
        let count = read_u32([entry[4], entry[5], entry[6], entry[7]]) as u64;
        let offset = read_u32([entry[8], entry[9], entry[10], entry[11]]) as u64;
        assert!(count > "OME-TIFF".len() as u64 + 1);

        let mut xml = vec![0u8; count as usize];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut xml).unwrap();
        assert_eq!(xml[0], b'<');
        assert_eq!(*xml.last().unwrap(), 0);
        let text = std::str::from_utf8(&xml[..xml.len() - 1]).unwrap();
        assert!(text.contains("TiffData"));
        assert!(text.contains("urn:uuid:"));
    }
    assert!(found, "ImageDescription entry missing");
}

#[test]
fn big_tiff_forced_output_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.ome.btf");

    let plane = gradient_plane(32, 32, 7);
    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(32, 32, 1, 1, 1)], PixelType::UInt8)))
        .unwrap();
    writer.set_big_tiff(Some(true));
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &plane).unwrap();
    writer.close().unwrap();

    let tiff = Tiff::open(&path).unwrap();
    assert!(tiff.is_big());
    drop(tiff);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, plane);
}

#[test]
fn lzw_compressed_output_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lzw.ome.tif");

    let plane = gradient_plane(64, 64, 11);
    let mut writer = OmeTiffWriter::new();
    writer
        .set_metadata_retrieve(Box::new(simple_meta(&[(64, 64, 1, 1, 1)], PixelType::UInt8)))
        .unwrap();
    writer.set_compression("LZW").unwrap();
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &plane).unwrap();
    writer.close().unwrap();

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, plane);
}

#[test]
fn planar_uint16_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("planar.ome.tif");

    // One channel carrying three samples per pixel, planar layout.
    let mut meta = OmeXmlMetadata::new();
    meta.set_pixels_size_x(16, 0);
    meta.set_pixels_size_y(8, 0);
    meta.set_pixels_size_z(1, 0);
    meta.set_pixels_size_c(3, 0);
    meta.set_pixels_size_t(1, 0);
    meta.set_pixels_type(PixelType::UInt16, 0);
    meta.set_pixels_dimension_order(DimensionOrder::XYZCT, 0);
    meta.set_pixels_big_endian(false, 0);
    meta.set_pixels_interleaved(false, 0);
    meta.set_channel_samples_per_pixel(3, 0, 0);

    let mut plane = VariantPixelBuffer::new(PixelType::UInt16, extents(16, 8, 3));
    for (i, value) in plane.data_mut::<u16>().unwrap().iter_mut().enumerate() {
        *value = (i * 13) as u16;
    }

    let mut writer = OmeTiffWriter::new();
    writer.set_metadata_retrieve(Box::new(meta)).unwrap();
    writer.set_interleaved(false);
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &plane).unwrap();
    writer.close().unwrap();

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    assert_eq!(reader.effective_size_c().unwrap(), 1);
    assert!(!reader.is_interleaved().unwrap());
    let mut readback = VariantPixelBuffer::new(PixelType::UInt16, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, plane);
}

/// Write a TIFF by hand whose first directory carries `xml` directly as its
/// `ImageDescription`.
fn write_raw_ome_tiff(path: &Path, xml: &str, planes: &[VariantPixelBuffer<'_>], w: u32, h: u32) {
    let mut sink = TiffSink::create(path, false).unwrap();
    for (i, plane) in planes.iter().enumerate() {
        let builder = sink.current_directory();
        builder.set_image_width(w);
        builder.set_image_height(h);
        builder.set_chunk_layout(ChunkLayout::Strips { rows_per_strip: h });
        builder.set_pixel_type(PixelType::UInt8, 8);
        builder.set_samples_per_pixel(1);
        builder.set_planar_configuration(PlanarConfiguration::Chunky);
        if i == 0 {
            builder.set_image_description(xml);
        }
        builder.write_region(0, 0, w, h, plane).unwrap();
        sink.write_current_directory().unwrap();
    }
    sink.close().unwrap();
}

#[test]
fn one_based_first_indices_are_rebased() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("onebased.ome.tif");

    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
  <Image ID="Image:0">
    <Pixels ID="Pixels:0" DimensionOrder="XYZCT" Type="uint8" SizeX="8" SizeY="8" SizeZ="1" SizeC="1" SizeT="2" BigEndian="false" Interleaved="true">
      <Channel ID="Channel:0:0" SamplesPerPixel="1"/>
      <TiffData IFD="0" FirstZ="1" FirstT="1" FirstC="1" PlaneCount="1"/>
      <TiffData IFD="1" FirstZ="1" FirstT="2" FirstC="1" PlaneCount="1"/>
    </Pixels>
  </Image>
</OME>"#;

    let planes = [gradient_plane(8, 8, 21), gradient_plane(8, 8, 22)];
    write_raw_ome_tiff(&path, xml, &planes, 8, 8);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    assert_eq!(reader.image_count().unwrap(), 2);
    let mapped = reader.planes().unwrap().to_vec();
    assert_eq!(mapped[0].ifd, 0);
    assert_eq!(mapped[1].ifd, 1);

    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, planes[0]);
}

#[test]
fn absent_uuid_means_the_file_owns_itself() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noid.ome.tif");

    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
  <Image ID="Image:0">
    <Pixels ID="Pixels:0" DimensionOrder="XYZCT" Type="uint8" SizeX="8" SizeY="8" SizeZ="1" SizeC="1" SizeT="1" BigEndian="false" Interleaved="true">
      <Channel ID="Channel:0:0" SamplesPerPixel="1"/>
      <TiffData IFD="0" PlaneCount="1"/>
    </Pixels>
  </Image>
</OME>"#;

    let planes = [gradient_plane(8, 8, 33)];
    write_raw_ome_tiff(&path, xml, &planes, 8, 8);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    reader.set_series(0).unwrap();
    let mapped = reader.planes().unwrap().to_vec();
    assert_eq!(
        mapped[0].id.clone().unwrap(),
        std::fs::canonicalize(&path).unwrap()
    );

    let mut readback = VariantPixelBuffer::new(PixelType::UInt8, extents(1, 1, 1));
    reader.open_bytes(0, &mut readback).unwrap();
    assert_eq!(readback, planes[0]);
}

#[test]
fn zero_plane_series_emit_empty_tiff_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zero.ome.tif");

    let mut meta = simple_meta(&[(8, 8, 1, 1, 1)], PixelType::UInt8);
    // Second series declares no planes at all.
    meta.set_pixels_size_x(8, 1);
    meta.set_pixels_size_y(8, 1);
    meta.set_pixels_size_z(0, 1);
    meta.set_pixels_size_c(1, 1);
    meta.set_pixels_size_t(1, 1);
    meta.set_pixels_type(PixelType::UInt8, 1);
    meta.set_pixels_dimension_order(DimensionOrder::XYZCT, 1);
    meta.set_channel_samples_per_pixel(1, 1, 0);

    let mut writer = OmeTiffWriter::new();
    writer.set_metadata_retrieve(Box::new(meta)).unwrap();
    writer.set_id(&path).unwrap();
    writer.save_bytes(0, &gradient_plane(8, 8, 1)).unwrap();
    writer.close().unwrap();

    // The written XML carries a single PlaneCount=0 TiffData for the empty
    // series; the reader drops that series and keeps the populated one.
    let mut tiff = Tiff::open(&path).unwrap();
    let description = tiff.directory(0).unwrap().ascii_field(Tag::ImageDescription).unwrap();
    drop(tiff);
    let parsed = ometiff::meta::xml::parse_ome_xml(&description).unwrap();
    use ometiff::MetadataRetrieve;
    assert_eq!(parsed.tiff_data_count(1), 1);
    assert_eq!(parsed.tiff_data_plane_count(1, 0).unwrap(), 0);

    let mut reader = OmeTiffReader::new();
    reader.set_id(&path).unwrap();
    assert_eq!(reader.series_count(), 1);
}
