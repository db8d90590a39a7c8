//! Multi-dimensional typed pixel container.

use std::io::{Read, Write};

use crate::error::{OmeTiffResult, UsageError};
use crate::meta::DimensionOrder;
use crate::pixel::{EndianType, PixelElement, PixelType};

/// Number of logical dimensions of a pixel buffer.
pub const DIMENSIONS: usize = 9;

/// Logical axes of a pixel buffer, in logical index order.
///
/// Only the first five are currently non-trivial; the Modulo axes subdivide
/// their parent axis and default to an extent of one.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(usize)]
pub enum Dimension {
    /// Spatial X (width).
    X = 0,
    /// Spatial Y (height).
    Y = 1,
    /// Spatial Z (depth).
    Z = 2,
    /// Sub-channel sample.
    Sample = 3,
    /// Time point.
    Time = 4,
    /// Effective channel.
    Channel = 5,
    ModuloZ = 6,
    ModuloT = 7,
    ModuloC = 8,
}

impl Dimension {
    pub const ALL: [Dimension; DIMENSIONS] = [
        Dimension::X,
        Dimension::Y,
        Dimension::Z,
        Dimension::Sample,
        Dimension::Time,
        Dimension::Channel,
        Dimension::ModuloZ,
        Dimension::ModuloT,
        Dimension::ModuloC,
    ];
}

/// Physical layout of a pixel buffer: a permutation of the nine axes from
/// fastest-varying to slowest, plus a per-axis traversal direction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct StorageOrder {
    /// `ordering[0]` is the fastest-varying dimension in memory.
    ordering: [Dimension; DIMENSIONS],
    /// Direction per position in `ordering`; a descending axis is addressed
    /// mirror-image.
    ascending: [bool; DIMENSIONS],
}

impl StorageOrder {
    pub fn new(ordering: [Dimension; DIMENSIONS], ascending: [bool; DIMENSIONS]) -> StorageOrder {
        StorageOrder {
            ordering,
            ascending,
        }
    }

    /// The storage order matching a dimension order and sample layout.
    ///
    /// Interleaved layouts vary the sample sub-channel fastest (before X);
    /// planar layouts keep whole sample planes contiguous. The remaining
    /// axes follow the dimension order's last three letters, each preceded
    /// by its Modulo sub-axis.
    pub fn make(order: DimensionOrder, interleaved: bool) -> StorageOrder {
        let mut ordering = [Dimension::X; DIMENSIONS];
        let mut next = 0;
        let mut push = |dim: Dimension, next: &mut usize| {
            ordering[*next] = dim;
            *next += 1;
        };

        if interleaved {
            push(Dimension::Sample, &mut next);
            push(Dimension::X, &mut next);
            push(Dimension::Y, &mut next);
        } else {
            push(Dimension::X, &mut next);
            push(Dimension::Y, &mut next);
            push(Dimension::Sample, &mut next);
        }

        for letter in order.zct_letters() {
            match letter {
                'Z' => {
                    push(Dimension::ModuloZ, &mut next);
                    push(Dimension::Z, &mut next);
                }
                'T' => {
                    push(Dimension::ModuloT, &mut next);
                    push(Dimension::Time, &mut next);
                }
                _ => {
                    push(Dimension::ModuloC, &mut next);
                    push(Dimension::Channel, &mut next);
                }
            }
        }

        StorageOrder {
            ordering,
            ascending: [true; DIMENSIONS],
        }
    }

    pub fn ordering(&self) -> &[Dimension; DIMENSIONS] {
        &self.ordering
    }

    pub fn ascending(&self) -> &[bool; DIMENSIONS] {
        &self.ascending
    }

    fn is_ascending(&self, dim: Dimension) -> bool {
        let pos = self
            .ordering
            .iter()
            .position(|d| *d == dim)
            .expect("storage order covers all dimensions");
        self.ascending[pos]
    }

    /// Physical element strides indexed by dimension.
    fn strides(&self, extents: &[usize; DIMENSIONS]) -> [usize; DIMENSIONS] {
        let mut strides = [0usize; DIMENSIONS];
        let mut stride = 1usize;
        for dim in self.ordering {
            strides[dim as usize] = stride;
            stride *= extents[dim as usize].max(1);
        }
        strides
    }
}

impl Default for StorageOrder {
    fn default() -> StorageOrder {
        StorageOrder::make(DimensionOrder::XYZTC, true)
    }
}

/// Backing memory of a pixel buffer: owned by the buffer or borrowed from an
/// externally managed allocation.
pub enum Storage<'d, T> {
    Owned(Vec<T>),
    Borrowed(&'d mut [T]),
}

impl<T> Storage<'_, T> {
    fn as_slice(&self) -> &[T] {
        match self {
            Storage::Owned(data) => data,
            Storage::Borrowed(data) => data,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            Storage::Owned(data) => data,
            Storage::Borrowed(data) => data,
        }
    }
}

/// A nine-dimensional typed pixel container.
///
/// Indexing is always by logical coordinates `(X, Y, Z, S, T, C, mZ, mT,
/// mC)` regardless of the physical storage order, which only governs the
/// element layout in memory and the raw serialisation order.
pub struct PixelBuffer<'d, T: PixelElement> {
    extents: [usize; DIMENSIONS],
    bases: [i64; DIMENSIONS],
    order: StorageOrder,
    endian: EndianType,
    strides: [usize; DIMENSIONS],
    storage: Storage<'d, T>,
}

impl<T: PixelElement> PixelBuffer<'static, T> {
    /// An owned buffer with the default interleaved storage order and native
    /// endianness.
    pub fn new(extents: [usize; DIMENSIONS]) -> PixelBuffer<'static, T> {
        Self::with_order(extents, StorageOrder::default(), EndianType::Native)
    }

    /// An owned buffer with an explicit storage order and endianness.
    pub fn with_order(
        extents: [usize; DIMENSIONS],
        order: StorageOrder,
        endian: EndianType,
    ) -> PixelBuffer<'static, T> {
        let count = extents.iter().map(|e| (*e).max(1)).product();
        PixelBuffer {
            extents,
            bases: [0; DIMENSIONS],
            strides: order.strides(&extents),
            order,
            endian,
            storage: Storage::Owned(vec![T::default(); count]),
        }
    }
}

impl<'d, T: PixelElement> PixelBuffer<'d, T> {
    /// A buffer over an externally managed region.
    ///
    /// The slice length must match the element count implied by the extents.
    pub fn from_borrowed(
        data: &'d mut [T],
        extents: [usize; DIMENSIONS],
        order: StorageOrder,
        endian: EndianType,
    ) -> OmeTiffResult<PixelBuffer<'d, T>> {
        let expected: usize = extents.iter().map(|e| (*e).max(1)).product();
        if data.len() != expected {
            return Err(UsageError::BufferSizeMismatch {
                actual: data.len(),
                expected,
            }
            .into());
        }
        Ok(PixelBuffer {
            extents,
            bases: [0; DIMENSIONS],
            strides: order.strides(&extents),
            order,
            endian,
            storage: Storage::Borrowed(data),
        })
    }

    pub fn pixel_type(&self) -> PixelType {
        T::PIXEL_TYPE
    }

    pub fn extents(&self) -> &[usize; DIMENSIONS] {
        &self.extents
    }

    pub fn extent(&self, dim: Dimension) -> usize {
        self.extents[dim as usize]
    }

    pub fn bases(&self) -> &[i64; DIMENSIONS] {
        &self.bases
    }

    /// Rebase the logical index range of every axis; extents are unchanged.
    pub fn set_bases(&mut self, bases: [i64; DIMENSIONS]) {
        self.bases = bases;
    }

    pub fn storage_order(&self) -> &StorageOrder {
        &self.order
    }

    pub fn endian(&self) -> EndianType {
        self.endian
    }

    pub fn num_elements(&self) -> usize {
        self.storage.as_slice().len()
    }

    /// Whether the storage is owned by the buffer rather than borrowed.
    pub fn is_managed(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// The elements in physical storage order.
    pub fn data(&self) -> &[T] {
        self.storage.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        self.storage.as_mut_slice()
    }

    /// The storage viewed as raw bytes, in physical order and host memory
    /// representation.
    pub fn as_bytes(&self) -> &[u8] {
        let data = self.storage.as_slice();
        // Every element type is a plain-old-data type of its in-memory size.
        unsafe {
            std::slice::from_raw_parts(
                data.as_ptr().cast::<u8>(),
                std::mem::size_of_val(data),
            )
        }
    }

    fn offset(&self, index: [i64; DIMENSIONS]) -> OmeTiffResult<usize> {
        let mut offset = 0usize;
        for dim in Dimension::ALL {
            let extent = self.extents[dim as usize].max(1);
            let coord = index[dim as usize] - self.bases[dim as usize];
            if coord < 0 || coord as usize >= extent {
                return Err(UsageError::BufferIndexOutOfRange.into());
            }
            let mut coord = coord as usize;
            if !self.order.is_ascending(dim) {
                coord = extent - 1 - coord;
            }
            offset += coord * self.strides[dim as usize];
        }
        Ok(offset)
    }

    /// Element at a logical index tuple.
    pub fn at(&self, index: [i64; DIMENSIONS]) -> OmeTiffResult<&T> {
        let offset = self.offset(index)?;
        Ok(&self.storage.as_slice()[offset])
    }

    pub fn at_mut(&mut self, index: [i64; DIMENSIONS]) -> OmeTiffResult<&mut T> {
        let offset = self.offset(index)?;
        Ok(&mut self.storage.as_mut_slice()[offset])
    }

    /// Assign the logical content of `src`, repacking into this buffer's
    /// storage order.
    ///
    /// The logical extents must match; bases and storage orders may differ.
    pub fn assign(&mut self, src: &PixelBuffer<'_, T>) -> OmeTiffResult<()> {
        if self.extents != src.extents {
            return Err(UsageError::BufferShapeMismatch.into());
        }
        if self.order == src.order && self.bases == src.bases {
            self.storage.as_mut_slice().copy_from_slice(src.data());
            return Ok(());
        }
        for index in logical_indices(self.extents) {
            let src_index = rebased(index, &src.bases);
            let dst_index = rebased(index, &self.bases);
            *self.at_mut(dst_index)? = *src.at(src_index)?;
        }
        Ok(())
    }

    /// Stream the elements to `writer` in physical storage order, converted
    /// to the buffer's endianness.
    pub fn write_raw<W: Write>(&self, writer: &mut W) -> OmeTiffResult<()> {
        for element in self.storage.as_slice() {
            element.write_element(writer, self.endian)?;
        }
        Ok(())
    }

    /// Fill the buffer from `reader`, consuming elements in physical storage
    /// order.
    pub fn read_raw<R: Read>(&mut self, reader: &mut R) -> OmeTiffResult<()> {
        let endian = self.endian;
        for element in self.storage.as_mut_slice() {
            *element = T::read_element(reader, endian)?;
        }
        Ok(())
    }
}

impl<T: PixelElement> PartialEq for PixelBuffer<'_, T> {
    /// Logical equality: pixel type and endianness tags, extents, and the
    /// element sequence addressed by logical index.
    fn eq(&self, other: &Self) -> bool {
        if self.endian.resolve() != other.endian.resolve() || self.extents != other.extents {
            return false;
        }
        logical_indices(self.extents).all(|index| {
            let a = self.at(rebased(index, &self.bases));
            let b = other.at(rebased(index, &other.bases));
            matches!((a, b), (Ok(a), Ok(b)) if a == b)
        })
    }
}

impl<T: PixelElement> std::fmt::Debug for PixelBuffer<'_, T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("PixelBuffer")
            .field("pixel_type", &T::PIXEL_TYPE)
            .field("extents", &self.extents)
            .field("endian", &self.endian)
            .field("managed", &self.is_managed())
            .finish()
    }
}

impl<T: PixelElement> PixelBuffer<'_, T> {
    /// Deep copy into a buffer that owns its storage.
    pub fn to_owned_buffer(&self) -> PixelBuffer<'static, T> {
        PixelBuffer {
            extents: self.extents,
            bases: self.bases,
            order: self.order,
            endian: self.endian,
            strides: self.strides,
            storage: Storage::Owned(self.storage.as_slice().to_vec()),
        }
    }
}

fn rebased(index: [usize; DIMENSIONS], bases: &[i64; DIMENSIONS]) -> [i64; DIMENSIONS] {
    let mut rebased = [0i64; DIMENSIONS];
    for (i, coord) in index.iter().enumerate() {
        rebased[i] = *coord as i64 + bases[i];
    }
    rebased
}

/// Iterate all index tuples of the given extents in logical order, X varying
/// fastest.
fn logical_indices(
    extents: [usize; DIMENSIONS],
) -> impl Iterator<Item = [usize; DIMENSIONS]> {
    let mut current = [0usize; DIMENSIONS];
    let total: usize = extents.iter().map(|e| (*e).max(1)).product();
    let mut emitted = 0usize;
    std::iter::from_fn(move || {
        if emitted == total {
            return None;
        }
        let item = current;
        emitted += 1;
        for axis in 0..DIMENSIONS {
            current[axis] += 1;
            if current[axis] < extents[axis].max(1) {
                break;
            }
            current[axis] = 0;
        }
        Some(item)
    })
}

/// Extents for a single 2-D plane region of `w`×`h` with `samples`
/// sub-channel samples.
pub(crate) fn plane_extents(w: usize, h: usize, samples: usize) -> [usize; DIMENSIONS] {
    [w, h, 1, samples, 1, 1, 1, 1, 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(x: i64, y: i64, s: i64) -> [i64; DIMENSIONS] {
        [x, y, 0, s, 0, 0, 0, 0, 0]
    }

    #[test]
    fn extents_imply_element_count() {
        let buffer: PixelBuffer<u16> = PixelBuffer::new([4, 3, 2, 1, 5, 1, 1, 1, 1]);
        assert_eq!(buffer.num_elements(), 4 * 3 * 2 * 5);
        assert_eq!(buffer.pixel_type(), PixelType::UInt16);
        assert!(buffer.is_managed());
    }

    #[test]
    fn index_out_of_range() {
        let buffer: PixelBuffer<u8> = PixelBuffer::new(plane_extents(4, 4, 1));
        assert!(buffer.at(index(3, 3, 0)).is_ok());
        assert!(buffer.at(index(4, 0, 0)).is_err());
        assert!(buffer.at(index(-1, 0, 0)).is_err());
    }

    #[test]
    fn borrowed_storage_size_checked() {
        let mut data = vec![0u8; 15];
        let result = PixelBuffer::from_borrowed(
            &mut data,
            plane_extents(4, 4, 1),
            StorageOrder::default(),
            EndianType::Native,
        );
        assert!(result.is_err());
    }

    #[test]
    fn borrowed_storage_aliases_caller_memory() {
        let mut data = vec![0u8; 16];
        {
            let mut buffer = PixelBuffer::from_borrowed(
                &mut data,
                plane_extents(4, 4, 1),
                StorageOrder::default(),
                EndianType::Native,
            )
            .unwrap();
            *buffer.at_mut(index(1, 2, 0)).unwrap() = 0x5a;
            assert!(!buffer.is_managed());
        }
        assert!(data.contains(&0x5a));
    }

    #[test]
    fn assignment_repacks_between_storage_orders() {
        let interleaved = StorageOrder::make(DimensionOrder::XYZTC, true);
        let planar = StorageOrder::make(DimensionOrder::XYCZT, false);

        let mut src: PixelBuffer<u8> =
            PixelBuffer::with_order(plane_extents(3, 2, 2), interleaved, EndianType::Native);
        let mut value = 0u8;
        for s in 0..2 {
            for y in 0..2 {
                for x in 0..3 {
                    *src.at_mut(index(x, y, s)).unwrap() = value;
                    value += 1;
                }
            }
        }

        let mut dst: PixelBuffer<u8> =
            PixelBuffer::with_order(plane_extents(3, 2, 2), planar, EndianType::Native);
        dst.assign(&src).unwrap();

        assert_eq!(dst, src);
        // The physical layouts differ even though the logical content agrees.
        assert_ne!(dst.data(), src.data());
        for s in 0..2 {
            for y in 0..2 {
                for x in 0..3 {
                    assert_eq!(
                        dst.at(index(x, y, s)).unwrap(),
                        src.at(index(x, y, s)).unwrap()
                    );
                }
            }
        }
    }

    #[test]
    fn raw_round_trip_preserves_content() {
        let mut buffer: PixelBuffer<u16> = PixelBuffer::with_order(
            plane_extents(5, 3, 1),
            StorageOrder::default(),
            EndianType::Big,
        );
        for (i, element) in buffer.data_mut().iter_mut().enumerate() {
            *element = (i * 7) as u16;
        }

        let mut bytes = Vec::new();
        buffer.write_raw(&mut bytes).unwrap();
        assert_eq!(bytes.len(), buffer.num_elements() * 2);

        let mut copy: PixelBuffer<u16> = PixelBuffer::with_order(
            plane_extents(5, 3, 1),
            StorageOrder::default(),
            EndianType::Big,
        );
        copy.read_raw(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(copy, buffer);
    }

    #[test]
    fn descending_axis_mirrors_coordinates() {
        let order = StorageOrder::new(
            StorageOrder::default().ordering,
            {
                let mut ascending = [true; DIMENSIONS];
                // Mirror the Y axis.
                let pos = StorageOrder::default()
                    .ordering
                    .iter()
                    .position(|d| *d == Dimension::Y)
                    .unwrap();
                ascending[pos] = false;
                ascending
            },
        );
        let mut buffer: PixelBuffer<u8> =
            PixelBuffer::with_order(plane_extents(2, 2, 1), order, EndianType::Native);
        *buffer.at_mut(index(0, 0, 0)).unwrap() = 1;
        // With Y descending, logical row 0 lands in the last physical row.
        assert_eq!(buffer.data()[2], 1);
    }

    #[test]
    fn rebased_indices() {
        let mut buffer: PixelBuffer<u8> = PixelBuffer::new(plane_extents(2, 2, 1));
        buffer.set_bases([-1, -1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(buffer.at(index(0, 0, 0)).is_ok());
        assert!(buffer.at(index(1, 1, 0)).is_err());
        assert!(buffer.at(index(-1, -1, 0)).is_ok());
    }
}
