//! Variant container over the eleven pixel-buffer specialisations.

use std::io::{Read, Write};

use num_complex::Complex;

use crate::error::{OmeTiffResult, UnsupportedError};
use crate::pixel::buffer::{PixelBuffer, StorageOrder, DIMENSIONS};
use crate::pixel::{EndianType, PixelElement, PixelType};

/// A pixel buffer whose element type is chosen at runtime.
///
/// Exactly one of the eleven `PixelBuffer` specialisations is resident.
/// Algorithms parameterised over the pixel type are written once as a
/// [`PixelVisitor`] and compiled per specialisation.
pub enum VariantPixelBuffer<'d> {
    Int8(PixelBuffer<'d, i8>),
    Int16(PixelBuffer<'d, i16>),
    Int32(PixelBuffer<'d, i32>),
    UInt8(PixelBuffer<'d, u8>),
    UInt16(PixelBuffer<'d, u16>),
    UInt32(PixelBuffer<'d, u32>),
    Bit(PixelBuffer<'d, bool>),
    Float(PixelBuffer<'d, f32>),
    Double(PixelBuffer<'d, f64>),
    ComplexFloat(PixelBuffer<'d, Complex<f32>>),
    ComplexDouble(PixelBuffer<'d, Complex<f64>>),
}

/// Dispatch `$buf` to `$body` with the resident buffer bound to `$inner`.
macro_rules! dispatch {
    ($buf:expr, $inner:ident => $body:expr) => {
        match $buf {
            VariantPixelBuffer::Int8($inner) => $body,
            VariantPixelBuffer::Int16($inner) => $body,
            VariantPixelBuffer::Int32($inner) => $body,
            VariantPixelBuffer::UInt8($inner) => $body,
            VariantPixelBuffer::UInt16($inner) => $body,
            VariantPixelBuffer::UInt32($inner) => $body,
            VariantPixelBuffer::Bit($inner) => $body,
            VariantPixelBuffer::Float($inner) => $body,
            VariantPixelBuffer::Double($inner) => $body,
            VariantPixelBuffer::ComplexFloat($inner) => $body,
            VariantPixelBuffer::ComplexDouble($inner) => $body,
        }
    };
}

/// A computation over a pixel buffer of any element type.
pub trait PixelVisitor {
    type Output;

    fn visit<T: PixelElement>(self, buffer: &PixelBuffer<'_, T>) -> Self::Output;
}

/// A mutating computation over a pixel buffer of any element type.
pub trait PixelVisitorMut {
    type Output;

    fn visit<T: PixelElement>(self, buffer: &mut PixelBuffer<'_, T>) -> Self::Output;
}

/// Internal projection from the variant to one typed specialisation.
pub trait VariantElement<'d>: PixelElement + Sized {
    fn project<'b>(variant: &'b VariantPixelBuffer<'d>) -> Option<&'b PixelBuffer<'d, Self>>;

    fn project_mut<'b>(
        variant: &'b mut VariantPixelBuffer<'d>,
    ) -> Option<&'b mut PixelBuffer<'d, Self>>;

    fn into_variant(buffer: PixelBuffer<'d, Self>) -> VariantPixelBuffer<'d>;
}

macro_rules! variant_element {
    ($elem:ty, $arm:ident) => {
        impl<'d> VariantElement<'d> for $elem {
            fn project<'b>(
                variant: &'b VariantPixelBuffer<'d>,
            ) -> Option<&'b PixelBuffer<'d, Self>> {
                match variant {
                    VariantPixelBuffer::$arm(buffer) => Some(buffer),
                    _ => None,
                }
            }

            fn project_mut<'b>(
                variant: &'b mut VariantPixelBuffer<'d>,
            ) -> Option<&'b mut PixelBuffer<'d, Self>> {
                match variant {
                    VariantPixelBuffer::$arm(buffer) => Some(buffer),
                    _ => None,
                }
            }

            fn into_variant(buffer: PixelBuffer<'d, Self>) -> VariantPixelBuffer<'d> {
                VariantPixelBuffer::$arm(buffer)
            }
        }
    };
}

variant_element!(i8, Int8);
variant_element!(i16, Int16);
variant_element!(i32, Int32);
variant_element!(u8, UInt8);
variant_element!(u16, UInt16);
variant_element!(u32, UInt32);
variant_element!(bool, Bit);
variant_element!(f32, Float);
variant_element!(f64, Double);
variant_element!(Complex<f32>, ComplexFloat);
variant_element!(Complex<f64>, ComplexDouble);

impl VariantPixelBuffer<'static> {
    /// An owned buffer of the given pixel type with the default storage
    /// order.
    pub fn new(pixel_type: PixelType, extents: [usize; DIMENSIONS]) -> VariantPixelBuffer<'static> {
        Self::with_order(
            pixel_type,
            extents,
            StorageOrder::default(),
            EndianType::Native,
        )
    }

    /// An owned buffer of the given pixel type, storage order and
    /// endianness.
    pub fn with_order(
        pixel_type: PixelType,
        extents: [usize; DIMENSIONS],
        order: StorageOrder,
        endian: EndianType,
    ) -> VariantPixelBuffer<'static> {
        use VariantPixelBuffer as V;
        match pixel_type {
            PixelType::Int8 => V::Int8(PixelBuffer::with_order(extents, order, endian)),
            PixelType::Int16 => V::Int16(PixelBuffer::with_order(extents, order, endian)),
            PixelType::Int32 => V::Int32(PixelBuffer::with_order(extents, order, endian)),
            PixelType::UInt8 => V::UInt8(PixelBuffer::with_order(extents, order, endian)),
            PixelType::UInt16 => V::UInt16(PixelBuffer::with_order(extents, order, endian)),
            PixelType::UInt32 => V::UInt32(PixelBuffer::with_order(extents, order, endian)),
            PixelType::Bit => V::Bit(PixelBuffer::with_order(extents, order, endian)),
            PixelType::Float => V::Float(PixelBuffer::with_order(extents, order, endian)),
            PixelType::Double => V::Double(PixelBuffer::with_order(extents, order, endian)),
            PixelType::ComplexFloat => {
                V::ComplexFloat(PixelBuffer::with_order(extents, order, endian))
            }
            PixelType::ComplexDouble => {
                V::ComplexDouble(PixelBuffer::with_order(extents, order, endian))
            }
        }
    }
}

impl<'d> VariantPixelBuffer<'d> {
    /// Wrap one typed buffer.
    pub fn from_buffer<T: VariantElement<'d>>(buffer: PixelBuffer<'d, T>) -> VariantPixelBuffer<'d> {
        T::into_variant(buffer)
    }

    pub fn pixel_type(&self) -> PixelType {
        dispatch!(self, buffer => buffer.pixel_type())
    }

    pub fn extents(&self) -> &[usize; DIMENSIONS] {
        dispatch!(self, buffer => buffer.extents())
    }

    pub fn endian(&self) -> EndianType {
        dispatch!(self, buffer => buffer.endian())
    }

    pub fn num_elements(&self) -> usize {
        dispatch!(self, buffer => buffer.num_elements())
    }

    pub fn is_managed(&self) -> bool {
        dispatch!(self, buffer => buffer.is_managed())
    }

    /// Invoke `visitor` on the resident specialisation.
    pub fn visit<V: PixelVisitor>(&self, visitor: V) -> V::Output {
        dispatch!(self, buffer => visitor.visit(buffer))
    }

    /// Invoke `visitor` on the resident specialisation, mutably.
    pub fn visit_mut<V: PixelVisitorMut>(&mut self, visitor: V) -> V::Output {
        dispatch!(self, buffer => visitor.visit(buffer))
    }

    /// The resident typed buffer.
    ///
    /// Fails with `WrongPixelType` if `T` does not match the resident type.
    pub fn array<T: VariantElement<'d>>(&self) -> OmeTiffResult<&PixelBuffer<'d, T>> {
        T::project(self).ok_or_else(|| {
            UnsupportedError::WrongPixelType {
                expected: T::PIXEL_TYPE,
                actual: self.pixel_type(),
            }
            .into()
        })
    }

    pub fn array_mut<T: VariantElement<'d>>(&mut self) -> OmeTiffResult<&mut PixelBuffer<'d, T>> {
        let actual = self.pixel_type();
        T::project_mut(self).ok_or_else(|| {
            UnsupportedError::WrongPixelType {
                expected: T::PIXEL_TYPE,
                actual,
            }
            .into()
        })
    }

    /// The elements in physical storage order.
    ///
    /// Fails with `WrongPixelType` if `T` does not match the resident type.
    pub fn data<T: VariantElement<'d>>(&self) -> OmeTiffResult<&[T]> {
        Ok(self.array::<T>()?.data())
    }

    pub fn data_mut<T: VariantElement<'d>>(&mut self) -> OmeTiffResult<&mut [T]> {
        Ok(self.array_mut::<T>()?.data_mut())
    }

    /// The storage viewed as raw bytes, independent of the element type.
    pub fn bytes(&self) -> &[u8] {
        dispatch!(self, buffer => buffer.as_bytes())
    }

    /// Deep assignment between two variants of equal pixel type and
    /// extents, repacking into this buffer's storage order.
    pub fn assign(&mut self, src: &VariantPixelBuffer<'_>) -> OmeTiffResult<()> {
        use VariantPixelBuffer as V;
        match (self, src) {
            (V::Int8(dst), V::Int8(src)) => dst.assign(src),
            (V::Int16(dst), V::Int16(src)) => dst.assign(src),
            (V::Int32(dst), V::Int32(src)) => dst.assign(src),
            (V::UInt8(dst), V::UInt8(src)) => dst.assign(src),
            (V::UInt16(dst), V::UInt16(src)) => dst.assign(src),
            (V::UInt32(dst), V::UInt32(src)) => dst.assign(src),
            (V::Bit(dst), V::Bit(src)) => dst.assign(src),
            (V::Float(dst), V::Float(src)) => dst.assign(src),
            (V::Double(dst), V::Double(src)) => dst.assign(src),
            (V::ComplexFloat(dst), V::ComplexFloat(src)) => dst.assign(src),
            (V::ComplexDouble(dst), V::ComplexDouble(src)) => dst.assign(src),
            (dst, src) => Err(UnsupportedError::WrongPixelType {
                expected: dst.pixel_type(),
                actual: src.pixel_type(),
            }
            .into()),
        }
    }

    /// Stream the elements in physical storage order.
    pub fn write_raw<W: Write>(&self, writer: &mut W) -> OmeTiffResult<()> {
        dispatch!(self, buffer => buffer.write_raw(writer))
    }

    /// Fill the buffer in physical storage order.
    pub fn read_raw<R: Read>(&mut self, reader: &mut R) -> OmeTiffResult<()> {
        dispatch!(self, buffer => buffer.read_raw(reader))
    }
}

impl PartialEq for VariantPixelBuffer<'_> {
    fn eq(&self, other: &Self) -> bool {
        use VariantPixelBuffer as V;
        match (self, other) {
            (V::Int8(a), V::Int8(b)) => a == b,
            (V::Int16(a), V::Int16(b)) => a == b,
            (V::Int32(a), V::Int32(b)) => a == b,
            (V::UInt8(a), V::UInt8(b)) => a == b,
            (V::UInt16(a), V::UInt16(b)) => a == b,
            (V::UInt32(a), V::UInt32(b)) => a == b,
            (V::Bit(a), V::Bit(b)) => a == b,
            (V::Float(a), V::Float(b)) => a == b,
            (V::Double(a), V::Double(b)) => a == b,
            (V::ComplexFloat(a), V::ComplexFloat(b)) => a == b,
            (V::ComplexDouble(a), V::ComplexDouble(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for VariantPixelBuffer<'_> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("VariantPixelBuffer")
            .field("pixel_type", &self.pixel_type())
            .field("extents", self.extents())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::buffer::plane_extents;

    struct MinMax;

    impl PixelVisitor for MinMax {
        type Output = (f64, f64);

        fn visit<T: PixelElement>(self, buffer: &PixelBuffer<'_, T>) -> (f64, f64) {
            // Element-agnostic reduction via the debug formatting is not
            // possible; use the byte span length as a stand-in check and
            // count elements instead.
            let count = buffer.num_elements() as f64;
            (count, count)
        }
    }

    #[test]
    fn resident_type_is_tracked() {
        let buffer = VariantPixelBuffer::new(PixelType::UInt16, plane_extents(4, 4, 1));
        assert_eq!(buffer.pixel_type(), PixelType::UInt16);
        assert!(buffer.array::<u16>().is_ok());
        assert!(buffer.array::<u8>().is_err());
        assert!(buffer.data::<f32>().is_err());
    }

    #[test]
    fn visitors_dispatch_once() {
        let buffer = VariantPixelBuffer::new(PixelType::Float, plane_extents(2, 3, 1));
        let (count, _) = buffer.visit(MinMax);
        assert_eq!(count, 6.0);
    }

    #[test]
    fn bytes_span_covers_storage() {
        let buffer = VariantPixelBuffer::new(PixelType::Int32, plane_extents(2, 2, 1));
        assert_eq!(buffer.bytes().len(), 4 * 4);
        let complex = VariantPixelBuffer::new(PixelType::ComplexDouble, plane_extents(2, 2, 1));
        assert_eq!(complex.bytes().len(), 4 * 16);
    }

    #[test]
    fn assignment_requires_matching_types() {
        let mut dst = VariantPixelBuffer::new(PixelType::UInt8, plane_extents(2, 2, 1));
        let src = VariantPixelBuffer::new(PixelType::UInt16, plane_extents(2, 2, 1));
        assert!(dst.assign(&src).is_err());

        let mut src = VariantPixelBuffer::new(PixelType::UInt8, plane_extents(2, 2, 1));
        src.data_mut::<u8>().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        dst.assign(&src).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn bit_buffers_use_boolean_elements() {
        let mut buffer = VariantPixelBuffer::new(PixelType::Bit, plane_extents(8, 1, 1));
        buffer.data_mut::<bool>().unwrap()[3] = true;
        assert_eq!(buffer.pixel_type(), PixelType::Bit);
        assert_eq!(buffer.bytes()[3], 1);
    }
}
