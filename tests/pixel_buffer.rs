//! Pixel buffer container properties: logical indexing, storage-order
//! repacking and raw serialisation.

use num_complex::Complex;

use ometiff::meta::DimensionOrder;
use ometiff::pixel::{PixelBuffer, StorageOrder, VariantPixelBuffer};
use ometiff::{EndianType, PixelType};

fn extents(w: usize, h: usize, s: usize) -> [usize; 9] {
    [w, h, 1, s, 1, 1, 1, 1, 1]
}

fn index(x: i64, y: i64, s: i64) -> [i64; 9] {
    [x, y, 0, s, 0, 0, 0, 0, 0]
}

#[test]
fn every_pixel_type_constructs() {
    for pt in PixelType::VALUES {
        let buf = VariantPixelBuffer::new(pt, extents(4, 3, 2));
        assert_eq!(buf.pixel_type(), pt);
        assert_eq!(buf.num_elements(), 24);
        assert_eq!(buf.bytes().len(), 24 * pt.byte_size());
    }
}

#[test]
fn typed_projection_checks_the_resident_type() {
    let buf = VariantPixelBuffer::new(PixelType::Double, extents(2, 2, 1));
    assert!(buf.array::<f64>().is_ok());
    assert!(buf.array::<f32>().is_err());
    assert!(buf.array::<Complex<f64>>().is_err());

    let complex = VariantPixelBuffer::new(PixelType::ComplexFloat, extents(2, 2, 1));
    assert!(complex.array::<Complex<f32>>().is_ok());
    assert!(complex.array::<f32>().is_err());
}

#[test]
fn raw_serialisation_round_trips() {
    // Invariant: deserialising a buffer's own serialisation reproduces it,
    // for each endianness tag.
    for endian in [EndianType::Big, EndianType::Little, EndianType::Native] {
        let mut buf: PixelBuffer<i16> =
            PixelBuffer::with_order(extents(7, 5, 1), StorageOrder::default(), endian);
        for (i, value) in buf.data_mut().iter_mut().enumerate() {
            *value = i as i16 - 17;
        }

        let mut stream = Vec::new();
        buf.write_raw(&mut stream).unwrap();

        let mut copy: PixelBuffer<i16> =
            PixelBuffer::with_order(extents(7, 5, 1), StorageOrder::default(), endian);
        copy.read_raw(&mut std::io::Cursor::new(stream)).unwrap();
        assert_eq!(copy, buf);
    }
}

#[test]
fn serialisation_streams_physical_order() {
    // The stream is the physical element sequence, so two logically equal
    // buffers with different storage orders serialise differently.
    let interleaved = StorageOrder::make(DimensionOrder::XYZCT, true);
    let planar = StorageOrder::make(DimensionOrder::XYZCT, false);

    let mut a: PixelBuffer<u8> =
        PixelBuffer::with_order(extents(2, 1, 2), interleaved, EndianType::Native);
    for y in 0..1 {
        for x in 0..2 {
            for s in 0..2 {
                *a.at_mut(index(x, y, s)).unwrap() = (10 * x + s) as u8;
            }
        }
    }
    let mut b: PixelBuffer<u8> =
        PixelBuffer::with_order(extents(2, 1, 2), planar, EndianType::Native);
    b.assign(&a).unwrap();
    assert_eq!(a, b);

    let mut stream_a = Vec::new();
    let mut stream_b = Vec::new();
    a.write_raw(&mut stream_a).unwrap();
    b.write_raw(&mut stream_b).unwrap();
    assert_eq!(stream_a, vec![0, 1, 10, 11]);
    assert_eq!(stream_b, vec![0, 10, 1, 11]);
}

#[test]
fn logical_assignment_between_orders_preserves_elements() {
    for order in DimensionOrder::VALUES {
        for interleaved in [false, true] {
            let source_order = StorageOrder::make(order, interleaved);
            let mut source: PixelBuffer<u16> =
                PixelBuffer::with_order(extents(5, 4, 3), source_order, EndianType::Native);
            for y in 0..4 {
                for x in 0..5 {
                    for s in 0..3 {
                        *source.at_mut(index(x, y, s)).unwrap() =
                            (100 * x + 10 * y + s) as u16;
                    }
                }
            }

            let mut target: PixelBuffer<u16> = PixelBuffer::new(extents(5, 4, 3));
            target.assign(&source).unwrap();
            assert_eq!(target, source);
            for y in 0..4 {
                for x in 0..5 {
                    for s in 0..3 {
                        assert_eq!(
                            *target.at(index(x, y, s)).unwrap(),
                            (100 * x + 10 * y + s) as u16
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn variant_assignment_requires_compatible_shape() {
    let mut dst = VariantPixelBuffer::new(PixelType::Float, extents(4, 4, 1));
    let smaller = VariantPixelBuffer::new(PixelType::Float, extents(2, 2, 1));
    assert!(dst.assign(&smaller).is_err());

    let wrong_type = VariantPixelBuffer::new(PixelType::Double, extents(4, 4, 1));
    assert!(dst.assign(&wrong_type).is_err());
}

#[test]
fn out_of_range_indexing_fails() {
    let buf: PixelBuffer<u8> = PixelBuffer::new(extents(3, 3, 1));
    assert!(buf.at(index(2, 2, 0)).is_ok());
    assert!(buf.at(index(3, 0, 0)).is_err());
    assert!(buf.at(index(0, 0, 1)).is_err());
    assert!(buf.at([0, 0, 1, 0, 0, 0, 0, 0, 0]).is_err());
}

#[test]
fn borrowed_buffers_serve_external_memory() {
    let mut backing = vec![0u16; 12];
    {
        let mut view = PixelBuffer::from_borrowed(
            &mut backing,
            extents(4, 3, 1),
            StorageOrder::default(),
            EndianType::Native,
        )
        .unwrap();
        assert!(!view.is_managed());
        *view.at_mut(index(3, 2, 0)).unwrap() = 99;

        let mut owned: PixelBuffer<u16> = PixelBuffer::new(extents(4, 3, 1));
        owned.assign(&view).unwrap();
        assert_eq!(owned, view);
    }
    assert!(backing.contains(&99));
}

#[test]
fn complex_buffers_hold_complex_elements() {
    let mut buf = VariantPixelBuffer::new(PixelType::ComplexDouble, extents(2, 2, 1));
    buf.data_mut::<Complex<f64>>().unwrap()[0] = Complex::new(1.5, -2.5);
    let elements = buf.data::<Complex<f64>>().unwrap();
    assert_eq!(elements[0], Complex::new(1.5, -2.5));

    let mut stream = Vec::new();
    buf.write_raw(&mut stream).unwrap();
    assert_eq!(stream.len(), 4 * 16);
}
