//! OME-XML document codec.
//!
//! Parses and serialises the subset of the OME data model this codec
//! consumes: `Image`/`Pixels`/`Channel`/`TiffData` (with the `UUID`
//! cross-references of multi-file datasets), `Plane` indices, `BinaryOnly`
//! redirects, and the structured annotations carrying pyramid resolutions
//! and Modulo sub-dimensions.

use std::collections::BTreeMap;
use std::fmt::Display;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{FormatError, OmeTiffError, OmeTiffResult};
use crate::meta::{
    BinaryOnly, ChannelMeta, Modulo, OmeXmlMetadata, PlaneMeta, Resolution, TiffDataMeta,
};

const OME_XMLNS: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";
const RESOLUTION_NAMESPACE: &str = "openmicroscopy.org/omero/resolution";
const MODULO_NAMESPACE: &str = "openmicroscopy.org/omero/dimension/modulo";

fn xml_err(err: impl Display) -> OmeTiffError {
    FormatError::MalformedOmeXml(err.to_string()).into()
}

fn attr_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Series index embedded in an annotation ID such as
/// `Annotation:Resolution:3`.
fn annotation_series(id: &str, kind: &str) -> Option<usize> {
    let rest = id.strip_prefix("Annotation:")?.strip_prefix(kind)?;
    rest.strip_prefix(':')?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AnnotationKind {
    Resolution(usize),
    Modulo(usize),
    Other,
}

#[derive(Debug, Default)]
struct ParseState {
    image: Option<usize>,
    tiff_data: Option<usize>,
    text: String,
    in_acquisition_date: bool,
    in_tiff_data_uuid: bool,
    tiff_data_uuid_file: Option<String>,
    annotation: Option<AnnotationKind>,
    map_key: Option<usize>,
    tiers: BTreeMap<usize, Resolution>,
}

/// Parse an OME-XML document into a metadata store.
///
/// A quick well-formedness check precedes parsing: the document must begin
/// with `<` and end with `>`.
pub fn parse_ome_xml(text: &str) -> OmeTiffResult<OmeXmlMetadata> {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if !trimmed.starts_with('<') || !trimmed.ends_with('>') {
        return Err(FormatError::MalformedOmeXml(String::from(
            "document does not start with `<` and end with `>`",
        ))
        .into());
    }

    let mut reader = Reader::from_reader(trimmed.as_bytes());
    reader.config_mut().trim_text(true);

    let mut meta = OmeXmlMetadata::new();
    let mut state = ParseState::default();
    let mut saw_ome = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                handle_start(&mut meta, &mut state, e, &mut saw_ome)?;
            }
            Ok(Event::Empty(ref e)) => {
                handle_start(&mut meta, &mut state, e, &mut saw_ome)?;
                handle_end(&mut meta, &mut state, e.name().as_ref());
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(xml_err)?;
                state.text.push_str(&text);
            }
            Ok(Event::End(ref e)) => {
                handle_end(&mut meta, &mut state, e.name().as_ref());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(xml_err(err)),
        }
        buf.clear();
    }

    if !saw_ome {
        return Err(FormatError::MalformedOmeXml(String::from("no OME root element")).into());
    }
    Ok(meta)
}

fn handle_start(
    meta: &mut OmeXmlMetadata,
    state: &mut ParseState,
    e: &BytesStart,
    saw_ome: &mut bool,
) -> OmeTiffResult<()> {
    let name = e.name();
    state.text.clear();
    match name.as_ref() {
        b"OME" => {
            *saw_ome = true;
            for attr in e.attributes().flatten() {
                if attr.key.as_ref() == b"UUID" {
                    meta.uuid = Some(attr_string(&attr.value));
                }
            }
        }
        b"BinaryOnly" => {
            let mut metadata_file = None;
            let mut uuid = None;
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"MetadataFile" => metadata_file = Some(attr_string(&attr.value)),
                    b"UUID" => uuid = Some(attr_string(&attr.value)),
                    _ => {}
                }
            }
            if let Some(metadata_file) = metadata_file {
                meta.binary_only = Some(BinaryOnly {
                    metadata_file,
                    uuid,
                });
            }
        }
        b"Image" => {
            let index = meta.images.len();
            meta.ensure_image(index);
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"ID" => meta.images[index].id = Some(attr_string(&attr.value)),
                    b"Name" => meta.images[index].name = Some(attr_string(&attr.value)),
                    _ => {}
                }
            }
            state.image = Some(index);
        }
        b"AcquisitionDate" => {
            state.in_acquisition_date = true;
        }
        b"Pixels" => {
            if let Some(image) = state.image {
                let pixels = &mut meta.image_mut(image).pixels;
                for attr in e.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"ID" => pixels.id = Some(value),
                        b"DimensionOrder" => {
                            pixels.dimension_order =
                                Some(value.parse().map_err(xml_err)?)
                        }
                        b"Type" => pixels.pixel_type = Some(value.parse().map_err(xml_err)?),
                        b"SignificantBits" => {
                            pixels.significant_bits = Some(value.parse().map_err(xml_err)?)
                        }
                        b"BigEndian" => pixels.big_endian = Some(value == "true"),
                        b"Interleaved" => pixels.interleaved = Some(value == "true"),
                        b"SizeX" => pixels.size_x = Some(value.parse().map_err(xml_err)?),
                        b"SizeY" => pixels.size_y = Some(value.parse().map_err(xml_err)?),
                        b"SizeZ" => pixels.size_z = Some(value.parse().map_err(xml_err)?),
                        b"SizeC" => pixels.size_c = Some(value.parse().map_err(xml_err)?),
                        b"SizeT" => pixels.size_t = Some(value.parse().map_err(xml_err)?),
                        _ => {}
                    }
                }
            }
        }
        b"Channel" => {
            if let Some(image) = state.image {
                let mut channel = ChannelMeta::default();
                for attr in e.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"ID" => channel.id = Some(value),
                        b"Name" => channel.name = Some(value),
                        b"SamplesPerPixel" => {
                            channel.samples_per_pixel = Some(value.parse().map_err(xml_err)?)
                        }
                        _ => {}
                    }
                }
                meta.image_mut(image).pixels.channels.push(channel);
            }
        }
        b"TiffData" => {
            if let Some(image) = state.image {
                let mut tiff_data = TiffDataMeta::default();
                for attr in e.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"IFD" => tiff_data.ifd = Some(value.parse().map_err(xml_err)?),
                        b"PlaneCount" => {
                            tiff_data.plane_count = Some(value.parse().map_err(xml_err)?)
                        }
                        b"FirstZ" => tiff_data.first_z = Some(value.parse().map_err(xml_err)?),
                        b"FirstC" => tiff_data.first_c = Some(value.parse().map_err(xml_err)?),
                        b"FirstT" => tiff_data.first_t = Some(value.parse().map_err(xml_err)?),
                        _ => {}
                    }
                }
                let pixels = &mut meta.image_mut(image).pixels;
                pixels.tiff_data.push(tiff_data);
                state.tiff_data = Some(pixels.tiff_data.len() - 1);
            }
        }
        b"UUID" => {
            if state.tiff_data.is_some() {
                state.in_tiff_data_uuid = true;
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"FileName" {
                        state.tiff_data_uuid_file = Some(attr_string(&attr.value));
                    }
                }
            }
        }
        b"BinData" => {
            if let Some(image) = state.image {
                meta.image_mut(image).pixels.bin_data_count += 1;
            }
        }
        b"Plane" => {
            if let Some(image) = state.image {
                let mut plane = PlaneMeta::default();
                for attr in e.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"TheZ" => plane.the_z = Some(value.parse().map_err(xml_err)?),
                        b"TheC" => plane.the_c = Some(value.parse().map_err(xml_err)?),
                        b"TheT" => plane.the_t = Some(value.parse().map_err(xml_err)?),
                        _ => {}
                    }
                }
                meta.image_mut(image).pixels.planes.push(plane);
            }
        }
        b"MapAnnotation" | b"XMLAnnotation" => {
            let mut id = String::new();
            let mut namespace = String::new();
            for attr in e.attributes().flatten() {
                match attr.key.as_ref() {
                    b"ID" => id = attr_string(&attr.value),
                    b"Namespace" => namespace = attr_string(&attr.value),
                    _ => {}
                }
            }
            state.annotation = Some(if namespace == RESOLUTION_NAMESPACE {
                match annotation_series(&id, "Resolution") {
                    Some(series) => AnnotationKind::Resolution(series),
                    None => AnnotationKind::Other,
                }
            } else if namespace == MODULO_NAMESPACE {
                match annotation_series(&id, "Modulo") {
                    Some(series) => AnnotationKind::Modulo(series),
                    None => AnnotationKind::Other,
                }
            } else {
                AnnotationKind::Other
            });
            state.tiers.clear();
        }
        b"M" => {
            state.map_key = None;
            for attr in e.attributes().flatten() {
                if attr.key.as_ref() == b"K" {
                    state.map_key = attr_string(&attr.value).parse().ok();
                }
            }
        }
        b"ModuloAlongZ" | b"ModuloAlongT" | b"ModuloAlongC" => {
            if let Some(AnnotationKind::Modulo(series)) = state.annotation {
                let parent = match name.as_ref() {
                    b"ModuloAlongZ" => 'Z',
                    b"ModuloAlongT" => 'T',
                    _ => 'C',
                };
                let mut modulo = Modulo::new(parent);
                for attr in e.attributes().flatten() {
                    let value = attr_string(&attr.value);
                    match attr.key.as_ref() {
                        b"Start" => modulo.start = value.parse().map_err(xml_err)?,
                        b"End" => modulo.end = value.parse().map_err(xml_err)?,
                        b"Step" => modulo.step = value.parse().map_err(xml_err)?,
                        _ => {}
                    }
                }
                let pixels = &mut meta.image_mut(series).pixels;
                match parent {
                    'Z' => pixels.modulo_z = Some(modulo),
                    'T' => pixels.modulo_t = Some(modulo),
                    _ => pixels.modulo_c = Some(modulo),
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn handle_end(meta: &mut OmeXmlMetadata, state: &mut ParseState, name: &[u8]) {
    match name {
        b"Image" => {
            state.image = None;
        }
        b"AcquisitionDate" => {
            if state.in_acquisition_date {
                if let Some(image) = state.image {
                    meta.image_mut(image).acquisition_date = Some(state.text.trim().to_string());
                }
                state.in_acquisition_date = false;
            }
            state.text.clear();
        }
        b"TiffData" => {
            state.tiff_data = None;
        }
        b"UUID" => {
            if state.in_tiff_data_uuid {
                if let (Some(image), Some(td)) = (state.image, state.tiff_data) {
                    let entry = &mut meta.image_mut(image).pixels.tiff_data[td];
                    let value = state.text.trim();
                    if !value.is_empty() {
                        entry.uuid_value = Some(value.to_string());
                    }
                    entry.uuid_file_name = state.tiff_data_uuid_file.take();
                }
                state.in_tiff_data_uuid = false;
            }
            state.text.clear();
        }
        b"M" => {
            if let (Some(AnnotationKind::Resolution(_)), Some(key)) =
                (state.annotation, state.map_key)
            {
                let fields: Vec<u32> = state
                    .text
                    .split_whitespace()
                    .filter_map(|v| v.parse().ok())
                    .collect();
                if fields.len() == 3 {
                    state.tiers.insert(
                        key,
                        Resolution {
                            size_x: fields[0],
                            size_y: fields[1],
                            size_z: fields[2],
                        },
                    );
                }
            }
            state.map_key = None;
            state.text.clear();
        }
        b"MapAnnotation" => {
            if let Some(AnnotationKind::Resolution(series)) = state.annotation {
                let tiers: Vec<Resolution> = state.tiers.values().copied().collect();
                if !tiers.is_empty() {
                    meta.resolutions.insert(series, tiers);
                }
            }
            state.annotation = None;
            state.tiers.clear();
        }
        b"XMLAnnotation" => {
            state.annotation = None;
        }
        _ => {}
    }
}

/// Serialise a metadata store to an OME-XML document.
pub fn serialize_ome_xml(meta: &OmeXmlMetadata) -> OmeTiffResult<String> {
    let mut xml = Writer::new(Vec::new());

    xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut ome = BytesStart::new("OME");
    ome.push_attribute(("xmlns", OME_XMLNS));
    if let Some(uuid) = &meta.uuid {
        ome.push_attribute(("UUID", uuid.as_str()));
    }
    xml.write_event(Event::Start(ome)).map_err(xml_err)?;

    if let Some(binary_only) = &meta.binary_only {
        let mut e = BytesStart::new("BinaryOnly");
        e.push_attribute(("MetadataFile", binary_only.metadata_file.as_str()));
        if let Some(uuid) = &binary_only.uuid {
            e.push_attribute(("UUID", uuid.as_str()));
        }
        xml.write_event(Event::Empty(e)).map_err(xml_err)?;
    }

    for (index, image) in meta.images.iter().enumerate() {
        let mut e = BytesStart::new("Image");
        let id = image
            .id
            .clone()
            .unwrap_or_else(|| format!("Image:{}", index));
        e.push_attribute(("ID", id.as_str()));
        if let Some(name) = &image.name {
            e.push_attribute(("Name", name.as_str()));
        }
        xml.write_event(Event::Start(e)).map_err(xml_err)?;

        if let Some(date) = &image.acquisition_date {
            xml.write_event(Event::Start(BytesStart::new("AcquisitionDate")))
                .map_err(xml_err)?;
            xml.write_event(Event::Text(BytesText::new(date)))
                .map_err(xml_err)?;
            xml.write_event(Event::End(BytesEnd::new("AcquisitionDate")))
                .map_err(xml_err)?;
        }

        let pixels = &image.pixels;
        let mut p = BytesStart::new("Pixels");
        let pixels_id = pixels
            .id
            .clone()
            .unwrap_or_else(|| format!("Pixels:{}", index));
        p.push_attribute(("ID", pixels_id.as_str()));
        if let Some(order) = pixels.dimension_order {
            p.push_attribute(("DimensionOrder", order.to_string().as_str()));
        }
        if let Some(pixel_type) = pixels.pixel_type {
            p.push_attribute(("Type", pixel_type.to_string().as_str()));
        }
        if let Some(bits) = pixels.significant_bits {
            p.push_attribute(("SignificantBits", bits.to_string().as_str()));
        }
        if let Some(big_endian) = pixels.big_endian {
            p.push_attribute(("BigEndian", if big_endian { "true" } else { "false" }));
        }
        if let Some(interleaved) = pixels.interleaved {
            p.push_attribute(("Interleaved", if interleaved { "true" } else { "false" }));
        }
        for (attr, value) in [
            ("SizeX", pixels.size_x),
            ("SizeY", pixels.size_y),
            ("SizeZ", pixels.size_z),
            ("SizeC", pixels.size_c),
            ("SizeT", pixels.size_t),
        ] {
            if let Some(value) = value {
                p.push_attribute((attr, value.to_string().as_str()));
            }
        }
        xml.write_event(Event::Start(p)).map_err(xml_err)?;

        for (c, channel) in pixels.channels.iter().enumerate() {
            let mut e = BytesStart::new("Channel");
            let channel_id = channel
                .id
                .clone()
                .unwrap_or_else(|| format!("Channel:{}:{}", index, c));
            e.push_attribute(("ID", channel_id.as_str()));
            if let Some(name) = &channel.name {
                e.push_attribute(("Name", name.as_str()));
            }
            if let Some(samples) = channel.samples_per_pixel {
                e.push_attribute(("SamplesPerPixel", samples.to_string().as_str()));
            }
            xml.write_event(Event::Empty(e)).map_err(xml_err)?;
        }

        for tiff_data in &pixels.tiff_data {
            let mut e = BytesStart::new("TiffData");
            for (attr, value) in [
                ("IFD", tiff_data.ifd),
                ("PlaneCount", tiff_data.plane_count),
            ] {
                if let Some(value) = value {
                    e.push_attribute((attr, value.to_string().as_str()));
                }
            }
            for (attr, value) in [
                ("FirstZ", tiff_data.first_z),
                ("FirstT", tiff_data.first_t),
                ("FirstC", tiff_data.first_c),
            ] {
                if let Some(value) = value {
                    e.push_attribute((attr, value.to_string().as_str()));
                }
            }
            let has_uuid =
                tiff_data.uuid_value.is_some() || tiff_data.uuid_file_name.is_some();
            if has_uuid {
                xml.write_event(Event::Start(e)).map_err(xml_err)?;
                let mut u = BytesStart::new("UUID");
                if let Some(file_name) = &tiff_data.uuid_file_name {
                    u.push_attribute(("FileName", file_name.as_str()));
                }
                match &tiff_data.uuid_value {
                    Some(value) => {
                        xml.write_event(Event::Start(u)).map_err(xml_err)?;
                        xml.write_event(Event::Text(BytesText::new(value)))
                            .map_err(xml_err)?;
                        xml.write_event(Event::End(BytesEnd::new("UUID")))
                            .map_err(xml_err)?;
                    }
                    None => {
                        xml.write_event(Event::Empty(u)).map_err(xml_err)?;
                    }
                }
                xml.write_event(Event::End(BytesEnd::new("TiffData")))
                    .map_err(xml_err)?;
            } else {
                xml.write_event(Event::Empty(e)).map_err(xml_err)?;
            }
        }

        for plane in &pixels.planes {
            let mut e = BytesStart::new("Plane");
            for (attr, value) in [
                ("TheZ", plane.the_z),
                ("TheT", plane.the_t),
                ("TheC", plane.the_c),
            ] {
                if let Some(value) = value {
                    e.push_attribute((attr, value.to_string().as_str()));
                }
            }
            xml.write_event(Event::Empty(e)).map_err(xml_err)?;
        }

        xml.write_event(Event::End(BytesEnd::new("Pixels")))
            .map_err(xml_err)?;
        xml.write_event(Event::End(BytesEnd::new("Image")))
            .map_err(xml_err)?;
    }

    let has_modulo = meta
        .images
        .iter()
        .any(|i| i.pixels.modulo_z.is_some() || i.pixels.modulo_t.is_some() || i.pixels.modulo_c.is_some());
    if !meta.resolutions.is_empty() || has_modulo {
        xml.write_event(Event::Start(BytesStart::new("StructuredAnnotations")))
            .map_err(xml_err)?;

        for (series, tiers) in &meta.resolutions {
            let mut e = BytesStart::new("MapAnnotation");
            let id = format!("Annotation:Resolution:{}", series);
            e.push_attribute(("ID", id.as_str()));
            e.push_attribute(("Namespace", RESOLUTION_NAMESPACE));
            xml.write_event(Event::Start(e)).map_err(xml_err)?;
            xml.write_event(Event::Start(BytesStart::new("Value")))
                .map_err(xml_err)?;
            for (tier, resolution) in tiers.iter().enumerate() {
                let mut m = BytesStart::new("M");
                let key = (tier + 1).to_string();
                m.push_attribute(("K", key.as_str()));
                xml.write_event(Event::Start(m)).map_err(xml_err)?;
                let text = format!(
                    "{} {} {}",
                    resolution.size_x, resolution.size_y, resolution.size_z
                );
                xml.write_event(Event::Text(BytesText::new(&text)))
                    .map_err(xml_err)?;
                xml.write_event(Event::End(BytesEnd::new("M")))
                    .map_err(xml_err)?;
            }
            xml.write_event(Event::End(BytesEnd::new("Value")))
                .map_err(xml_err)?;
            xml.write_event(Event::End(BytesEnd::new("MapAnnotation")))
                .map_err(xml_err)?;
        }

        for (series, image) in meta.images.iter().enumerate() {
            let pixels = &image.pixels;
            let modulos = [&pixels.modulo_z, &pixels.modulo_t, &pixels.modulo_c];
            if modulos.iter().all(|m| m.is_none()) {
                continue;
            }
            let mut e = BytesStart::new("XMLAnnotation");
            let id = format!("Annotation:Modulo:{}", series);
            e.push_attribute(("ID", id.as_str()));
            e.push_attribute(("Namespace", MODULO_NAMESPACE));
            xml.write_event(Event::Start(e)).map_err(xml_err)?;
            xml.write_event(Event::Start(BytesStart::new("Value")))
                .map_err(xml_err)?;
            xml.write_event(Event::Start(BytesStart::new("Modulo")))
                .map_err(xml_err)?;
            for modulo in modulos.into_iter().flatten() {
                let name = match modulo.parent {
                    'Z' => "ModuloAlongZ",
                    'T' => "ModuloAlongT",
                    _ => "ModuloAlongC",
                };
                let mut m = BytesStart::new(name);
                m.push_attribute(("Start", modulo.start.to_string().as_str()));
                m.push_attribute(("End", modulo.end.to_string().as_str()));
                m.push_attribute(("Step", modulo.step.to_string().as_str()));
                xml.write_event(Event::Empty(m)).map_err(xml_err)?;
            }
            xml.write_event(Event::End(BytesEnd::new("Modulo")))
                .map_err(xml_err)?;
            xml.write_event(Event::End(BytesEnd::new("Value")))
                .map_err(xml_err)?;
            xml.write_event(Event::End(BytesEnd::new("XMLAnnotation")))
                .map_err(xml_err)?;
        }

        xml.write_event(Event::End(BytesEnd::new("StructuredAnnotations")))
            .map_err(xml_err)?;
    }

    xml.write_event(Event::End(BytesEnd::new("OME")))
        .map_err(xml_err)?;

    String::from_utf8(xml.into_inner()).map_err(|_| {
        FormatError::MalformedOmeXml(String::from("serialised document is not UTF-8")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MetadataRetrieve, MetadataStore};
    use crate::pixel::PixelType;

    const MINIMAL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06" UUID="urn:uuid:11111111-2222-3333-4444-555555555555">
  <Image ID="Image:0" Name="series one">
    <AcquisitionDate>2016-05-04T12:00:00</AcquisitionDate>
    <Pixels ID="Pixels:0" DimensionOrder="XYZCT" Type="uint8" SizeX="16" SizeY="16" SizeZ="1" SizeC="1" SizeT="2" BigEndian="false" Interleaved="true">
      <Channel ID="Channel:0:0" SamplesPerPixel="1"/>
      <TiffData IFD="0" FirstZ="0" FirstT="0" FirstC="0" PlaneCount="1">
        <UUID FileName="a.ome.tif">urn:uuid:11111111-2222-3333-4444-555555555555</UUID>
      </TiffData>
      <TiffData IFD="1" FirstZ="0" FirstT="1" FirstC="0" PlaneCount="1"/>
    </Pixels>
  </Image>
</OME>"#;

    #[test]
    fn parses_the_minimal_document() {
        let meta = parse_ome_xml(MINIMAL).unwrap();
        assert_eq!(meta.image_count(), 1);
        assert_eq!(meta.image_name(0).unwrap(), "series one");
        assert_eq!(meta.pixels_size_x(0).unwrap(), 16);
        assert_eq!(meta.pixels_size_t(0).unwrap(), 2);
        assert_eq!(meta.pixels_type(0).unwrap(), PixelType::UInt8);
        assert_eq!(meta.pixels_interleaved(0).unwrap(), true);
        assert_eq!(meta.channel_count(0), 1);
        assert_eq!(meta.tiff_data_count(0), 2);
        assert_eq!(meta.tiff_data_ifd(0, 0).unwrap(), 0);
        assert_eq!(meta.tiff_data_first_t(0, 1).unwrap(), 1);
        assert_eq!(meta.uuid_file_name(0, 0).unwrap(), "a.ome.tif");
        assert!(meta.uuid_value(0, 1).is_err());
        assert_eq!(
            meta.uuid().unwrap(),
            "urn:uuid:11111111-2222-3333-4444-555555555555"
        );
    }

    #[test]
    fn rejects_non_xml() {
        assert!(parse_ome_xml("not xml at all").is_err());
        assert!(parse_ome_xml("<NotOme/>").is_err());
    }

    #[test]
    fn round_trips_through_serialisation() {
        let meta = parse_ome_xml(MINIMAL).unwrap();
        let text = serialize_ome_xml(&meta).unwrap();
        assert!(text.starts_with("<?xml"));
        let reparsed = parse_ome_xml(&text).unwrap();
        assert_eq!(reparsed.image_count(), 1);
        assert_eq!(reparsed.pixels_size_x(0).unwrap(), 16);
        assert_eq!(reparsed.tiff_data_count(0), 2);
        assert_eq!(reparsed.uuid_file_name(0, 0).unwrap(), "a.ome.tif");
        assert_eq!(
            reparsed.image_acquisition_date(0).unwrap(),
            "2016-05-04T12:00:00"
        );
    }

    #[test]
    fn resolution_annotation_round_trip() {
        let mut meta = OmeXmlMetadata::new();
        meta.set_pixels_size_x(1024, 0);
        meta.set_resolutions(
            &[
                Resolution {
                    size_x: 512,
                    size_y: 512,
                    size_z: 1,
                },
                Resolution {
                    size_x: 256,
                    size_y: 256,
                    size_z: 1,
                },
            ],
            0,
        );
        let text = serialize_ome_xml(&meta).unwrap();
        let reparsed = parse_ome_xml(&text).unwrap();
        let tiers = reparsed.resolutions(0).unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].size_x, 512);
        assert_eq!(tiers[1].size_x, 256);
    }

    #[test]
    fn modulo_annotation_round_trip() {
        let mut meta = OmeXmlMetadata::new();
        meta.set_pixels_size_z(6, 0);
        let mut modulo = Modulo::new('Z');
        modulo.end = 4.0;
        modulo.step = 2.0;
        meta.image_mut(0).pixels.modulo_z = Some(modulo.clone());
        let text = serialize_ome_xml(&meta).unwrap();
        let reparsed = parse_ome_xml(&text).unwrap();
        assert_eq!(reparsed.modulo_along_z(0).unwrap(), modulo);
        assert!(reparsed.modulo_along_t(0).is_err());
    }

    #[test]
    fn binary_only_round_trip() {
        let mut meta = OmeXmlMetadata::new();
        meta.set_binary_only("series.companion.ome", Some("urn:uuid:abc"));
        let text = serialize_ome_xml(&meta).unwrap();
        let reparsed = parse_ome_xml(&text).unwrap();
        assert_eq!(
            reparsed.binary_only_metadata_file().unwrap(),
            "series.companion.ome"
        );
    }
}
