//! PE container access for managed images.
//!
//! This module opens a Portable Executable image, validates it with `goblin`, and records the
//! header fields needed to find the CLR runtime header (data directory 14) and to append a
//! section when the image is written back. It abstracts over where the bytes come from (a
//! memory-mapped file or an owned buffer) through the [`Backend`] trait.
//!
//! # Key Components
//!
//! - [`File`] - An opened image: the backing bytes plus the extracted [`ImageLayout`]
//! - [`Backend`] - Trait for data sources (disk files, memory buffers)
//! - [`ImageLayout`] / [`SectionInfo`] - Section table and header offsets, RVA translation
//! - [`LoadedImage`] - An owned copy of a loaded image that new sections can be appended to
//! - [`builder::ImageBuilder`] - Produces a fresh single-section managed image
//! - [`parser::Parser`] / [`io`] - Cursor parsing and little-endian primitives
//!
//! # Rewriting
//!
//! The loader never re-lays-out an image. Existing sections keep their offsets and contents
//! apart from in-place token fix-ups; new metadata and method bodies go into a section
//! appended after the last one, which needs one free section table slot in the header area.
//!
//! # Examples
//!
//! ```rust
//! use cilpatch::file::{builder::ImageBuilder, File};
//! use cilpatch::metadata::cor20header::Cor20Header;
//!
//! let cor20 = Cor20Header::new(0x2048, 4).write();
//! let image = ImageBuilder::new([cor20, b"BSJB".to_vec()].concat()).clr_header(0).build();
//! let file = File::from_mem(image)?;
//! assert_eq!(file.clr(), (0x2000, 72));
//! assert_eq!(file.rva_to_offset(0x2048)?, 0x248);
//! # Ok::<(), cilpatch::Error>(())
//! ```

pub mod builder;
pub mod io;
pub mod parser;

mod physical;

use std::path::Path;

use goblin::pe::PE;

use crate::{
    file::io::{read_le, write_le_at},
    Error::{BinaryFormat, Empty, Unsupported},
    Result,
};
use physical::Physical;

/// Size of one section table entry.
const SECTION_HEADER_SIZE: usize = 40;

/// Index of the CLR runtime header in the data directory table.
const CLR_RUNTIME_HEADER_DIRECTORY: usize = 14;

/// `IMAGE_SCN_CNT_INITIALIZED_DATA`
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
/// `IMAGE_SCN_MEM_READ`
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// Backend trait for file data sources.
///
/// Implemented by the memory-mapped [`physical::Physical`] backend and by owned buffers.
pub trait Backend: Send + Sync {
    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        checked_slice(self.data(), offset, len)
    }

    /// Returns the complete data.
    fn data(&self) -> &[u8];

    /// Returns the total size of the data.
    fn len(&self) -> usize {
        self.data().len()
    }
}

impl Backend for Vec<u8> {
    fn data(&self) -> &[u8] {
        self.as_slice()
    }
}

fn checked_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let Some(end) = offset.checked_add(len) else {
        return Err(out_of_bounds_error!());
    };
    data.get(offset..end).ok_or(out_of_bounds_error!())
}

/// One entry of the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section name, e.g. `.text`
    pub name: String,
    /// RVA of the section
    pub virtual_address: u32,
    /// `VirtualSize`
    pub virtual_size: u32,
    /// `PointerToRawData`
    pub raw_offset: u32,
    /// `SizeOfRawData`
    pub raw_size: u32,
    /// Section flags
    pub characteristics: u32,
}

impl SectionInfo {
    /// Bytes of address space the section covers.
    #[must_use]
    pub fn span(&self) -> u32 {
        self.virtual_size.max(self.raw_size)
    }

    /// Returns `true` if `rva` falls inside the section.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && u64::from(rva) < u64::from(self.virtual_address) + u64::from(self.span())
    }
}

/// The header fields needed to locate the managed data and to append a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    /// Offset of the `PE\0\0` signature
    pub pe_offset: usize,
    /// The image is PE32+
    pub is_64: bool,
    /// `FileAlignment` of the optional header
    pub file_alignment: u32,
    /// `SectionAlignment` of the optional header
    pub section_alignment: u32,
    /// `SizeOfHeaders` of the optional header
    pub size_of_headers: u32,
    /// File offset of the first section table entry
    pub section_table_offset: usize,
    /// The section table
    pub sections: Vec<SectionInfo>,
    /// RVA and size of the CLR runtime header
    pub clr_header: (u32, u32),
}

impl ImageLayout {
    fn from_pe(pe: &PE<'_>) -> Result<ImageLayout> {
        let Some(optional_header) = pe.header.optional_header.as_ref() else {
            return Err(BinaryFormat("image has no optional header".to_string()));
        };
        let clr_header = match optional_header.data_directories.get_clr_runtime_header() {
            Some(directory) if directory.virtual_address != 0 && directory.size != 0 => {
                (directory.virtual_address, directory.size)
            }
            _ => {
                return Err(BinaryFormat(
                    "image has no CLR runtime header directory".to_string(),
                ))
            }
        };

        let pe_offset = pe.header.dos_header.pe_pointer as usize;
        let mut sections = Vec::with_capacity(pe.sections.len());
        for section in &pe.sections {
            sections.push(SectionInfo {
                name: section.name()?.to_string(),
                virtual_address: section.virtual_address,
                virtual_size: section.virtual_size,
                raw_offset: section.pointer_to_raw_data,
                raw_size: section.size_of_raw_data,
                characteristics: section.characteristics,
            });
        }

        Ok(ImageLayout {
            pe_offset,
            is_64: pe.is_64,
            file_alignment: optional_header.windows_fields.file_alignment,
            section_alignment: optional_header.windows_fields.section_alignment,
            size_of_headers: optional_header.windows_fields.size_of_headers,
            section_table_offset: pe_offset
                + 24
                + usize::from(pe.header.coff_header.size_of_optional_header),
            sections,
            clr_header,
        })
    }

    /// The section mapping `rva`.
    #[must_use]
    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionInfo> {
        self.sections.iter().find(|section| section.contains(rva))
    }

    /// Converts an RVA into a file offset.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if no section maps `rva`, or if it falls into the
    /// zero-filled tail of a section that has no file backing.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        let (offset, _) = self.rva_to_range(rva)?;
        Ok(offset)
    }

    /// The file offset of `rva` and the end of its section's raw data.
    ///
    /// # Errors
    ///
    /// See [`ImageLayout::rva_to_offset`].
    pub fn rva_to_range(&self, rva: u32) -> Result<(usize, usize)> {
        let Some(section) = self.section_for_rva(rva) else {
            return Err(malformed_error!(
                "RVA could not be converted to offset - 0x{:X}",
                rva
            ));
        };

        let delta = rva - section.virtual_address;
        if delta >= section.raw_size {
            return Err(malformed_error!(
                "RVA 0x{:X} lies outside the raw data of section '{}'",
                rva,
                section.name
            ));
        }
        let start = section.raw_offset as usize;
        Ok((start + delta as usize, start + section.raw_size as usize))
    }

    /// File offset of the data directory entry `index`.
    #[must_use]
    pub fn data_directory_offset(&self, index: usize) -> usize {
        let directories = if self.is_64 { 112 } else { 96 };
        self.pe_offset + 24 + directories + index * 8
    }

    /// RVA the next appended section will be mapped at.
    #[must_use]
    pub fn next_section_rva(&self) -> u32 {
        let end = self
            .sections
            .iter()
            .map(|section| section.virtual_address.saturating_add(section.span()))
            .max()
            .unwrap_or(self.size_of_headers);
        align_up(end, self.section_alignment)
    }
}

/// An opened PE image carrying a CLR runtime header.
pub struct File {
    data: Box<dyn Backend>,
    layout: ImageLayout,
}

impl File {
    /// Memory-maps and validates the image at `file`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, [`crate::Error::Empty`]
    /// for empty files and [`crate::Error::BinaryFormat`] if it is not a managed PE image.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Validates an image held in memory.
    ///
    /// # Errors
    ///
    /// See [`File::from_file`].
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(data)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let layout = match PE::parse(data.data()) {
            Ok(pe) => ImageLayout::from_pe(&pe)?,
            Err(error) => return Err(BinaryFormat(error.to_string())),
        };

        let file = File {
            data: Box::new(data),
            layout,
        };
        // The CLR header must be backed by the file.
        let (clr_rva, clr_size) = file.clr();
        file.data_slice(file.rva_to_offset(clr_rva)?, clr_size as usize)
            .map_err(|_| malformed_error!("CLR header extends past the end of the file"))?;
        Ok(file)
    }

    /// Size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for an empty image; never the case for a loaded file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The complete image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }

    /// The header fields extracted at load time.
    #[must_use]
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// RVA and size of the CLR runtime header.
    #[must_use]
    pub fn clr(&self) -> (u32, u32) {
        self.layout.clr_header
    }

    /// Converts an RVA into a file offset.
    ///
    /// # Errors
    ///
    /// See [`ImageLayout::rva_to_offset`].
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        self.layout.rva_to_offset(rva)
    }

    /// Copies the image out of its backend so it can outlive the mapping.
    #[must_use]
    pub fn into_image(self) -> LoadedImage {
        LoadedImage {
            data: self.data().to_vec(),
            layout: self.layout,
        }
    }
}

/// An owned copy of a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Header fields of the image
    pub layout: ImageLayout,
    data: Vec<u8>,
}

impl LoadedImage {
    /// The image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns `len` bytes at `rva`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if `rva` is unmapped and
    /// [`crate::Error::OutOfBounds`] if the range exceeds the file.
    pub fn slice_at_rva(&self, rva: u32, len: usize) -> Result<&[u8]> {
        checked_slice(&self.data, self.layout.rva_to_offset(rva)?, len)
    }

    /// Bytes from `rva` to the end of its section's raw data.
    ///
    /// # Errors
    ///
    /// See [`LoadedImage::slice_at_rva`].
    pub fn tail_at_rva(&self, rva: u32) -> Result<&[u8]> {
        let (start, end) = self.layout.rva_to_range(rva)?;
        self.data
            .get(start..end.min(self.data.len()))
            .ok_or(out_of_bounds_error!())
    }

    /// Returns a copy of the image with `contents` appended as a new section.
    ///
    /// The section is mapped at [`ImageLayout::next_section_rva`], its raw data starts at
    /// the file-aligned end of the image, and `NumberOfSections`, `SizeOfImage` and
    /// `SizeOfInitializedData` are updated.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Unsupported`] if the header area has no room for another
    /// section table entry.
    pub fn append_section(&self, name: &str, contents: &[u8], characteristics: u32) -> Result<Vec<u8>> {
        let layout = &self.layout;
        let entry_offset = layout.section_table_offset + layout.sections.len() * SECTION_HEADER_SIZE;
        let headers_end = layout
            .sections
            .iter()
            .filter(|section| section.raw_size != 0)
            .map(|section| section.raw_offset as usize)
            .chain(std::iter::once(layout.size_of_headers as usize))
            .min()
            .unwrap_or(layout.size_of_headers as usize);
        if entry_offset + SECTION_HEADER_SIZE > headers_end {
            return Err(Unsupported(format!(
                "no room for another section header (table ends at 0x{entry_offset:X}, headers end at 0x{headers_end:X})"
            )));
        }

        let contents_size = u32::try_from(contents.len())
            .map_err(|_| Unsupported(format!("section of {} bytes", contents.len())))?;
        let file_len = u32::try_from(self.data.len())
            .map_err(|_| Unsupported(format!("image of {} bytes", self.data.len())))?;
        let rva = layout.next_section_rva();
        let raw_offset = align_up(file_len, layout.file_alignment);
        let raw_size = align_up(contents_size, layout.file_alignment);

        let mut image = self.data.clone();

        let mut header = [0u8; SECTION_HEADER_SIZE];
        let name_len = name.len().min(8);
        header[..name_len].copy_from_slice(&name.as_bytes()[..name_len]);
        let mut offset = 8;
        for value in [contents_size, rva, raw_size, raw_offset, 0, 0] {
            write_le_at(&mut header, &mut offset, value)?;
        }
        let mut offset = 36;
        write_le_at(&mut header, &mut offset, characteristics)?;
        image[entry_offset..entry_offset + SECTION_HEADER_SIZE].copy_from_slice(&header);

        let pe = layout.pe_offset;
        let count_offset = pe + 6;
        let count = read_le::<u16>(&image[count_offset..])?;
        write_le_at(&mut image, &mut { count_offset }, count + 1)?;

        let optional = pe + 24;
        let initialized = read_le::<u32>(&image[optional + 8..])?;
        write_le_at(&mut image, &mut { optional + 8 }, initialized.saturating_add(raw_size))?;
        let size_of_image = align_up(rva + contents_size.max(1), layout.section_alignment);
        write_le_at(&mut image, &mut { optional + 56 }, size_of_image)?;

        image.resize(raw_offset as usize, 0);
        image.extend_from_slice(contents);
        image.resize((raw_offset + raw_size) as usize, 0);

        log::debug!(
            "Appended section '{}' at RVA 0x{:X}, file offset 0x{:X}, {} bytes",
            name,
            rva,
            raw_offset,
            contents.len()
        );
        Ok(image)
    }
}

/// Rounds `value` up to a multiple of `alignment`; an alignment of 0 leaves it unchanged.
pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::builder::{ImageBuilder, TEXT_RVA},
        metadata::cor20header::Cor20Header,
    };

    fn managed_image(extra: usize) -> Vec<u8> {
        let mut text = Cor20Header::new(TEXT_RVA + 72, 4).write();
        text.extend_from_slice(b"BSJB");
        text.resize(text.len() + extra, 0xEE);
        ImageBuilder::new(text).clr_header(0).build()
    }

    #[test]
    fn test_load_built_image() {
        let file = File::from_mem(managed_image(0)).unwrap();
        let layout = file.layout();
        assert_eq!(layout.pe_offset, 0x80);
        assert!(!layout.is_64);
        assert_eq!(layout.file_alignment, 0x200);
        assert_eq!(layout.sections.len(), 1);
        assert_eq!(layout.sections[0].name, ".text");
        assert_eq!(file.clr(), (TEXT_RVA, 72));
        assert_eq!(layout.data_directory_offset(14), 0x168);
        let offset = file.rva_to_offset(TEXT_RVA + 72).unwrap();
        assert_eq!(file.data_slice(offset, 4).unwrap(), b"BSJB");
    }

    #[test]
    fn test_not_an_image() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Empty)));
        assert!(matches!(
            File::from_mem(b"not a portable executable".to_vec()),
            Err(BinaryFormat(_))
        ));
        // A PE image without data directory 14
        let unmanaged = ImageBuilder::new(vec![0; 16]).build();
        assert!(matches!(File::from_mem(unmanaged), Err(BinaryFormat(_))));
    }

    #[test]
    fn test_rva_translation() {
        let layout = File::from_mem(managed_image(0)).unwrap().layout().clone();
        // The first byte of a section maps
        assert_eq!(layout.rva_to_offset(TEXT_RVA).unwrap(), 0x200);
        assert_eq!(layout.rva_to_range(TEXT_RVA + 4).unwrap(), (0x204, 0x400));
        assert!(layout.rva_to_offset(TEXT_RVA - 1).is_err());
        // Mapped, but past the section's raw data
        assert!(layout.rva_to_offset(TEXT_RVA + 0x400).is_err());
        assert!(layout.rva_to_offset(0x10_0000).is_err());
        assert_eq!(layout.next_section_rva(), 0x4000);
    }

    #[test]
    fn test_append_section() {
        let image = managed_image(0x10);
        let loaded = File::from_mem(image.clone()).unwrap().into_image();
        let appended = loaded
            .append_section(".patch", &[0xAB; 0x210], IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ)
            .unwrap();

        // Original bytes are untouched apart from the headers.
        assert_eq!(&appended[0x200..image.len()], &image[0x200..]);
        assert_eq!(appended.len(), image.len() + 0x400);

        let pe = goblin::pe::PE::parse(&appended).unwrap();
        assert_eq!(pe.sections.len(), 2);
        let section = &pe.sections[1];
        assert_eq!(section.name().unwrap(), ".patch");
        assert_eq!(section.virtual_address, 0x4000);
        assert_eq!(section.virtual_size, 0x210);
        assert_eq!(section.pointer_to_raw_data as usize, image.len());
        assert_eq!(section.size_of_raw_data, 0x400);
        let optional = pe.header.optional_header.unwrap();
        assert_eq!(optional.windows_fields.size_of_image, 0x6000);

        let reloaded = File::from_mem(appended).unwrap();
        let offset = reloaded.rva_to_offset(0x4000).unwrap();
        assert_eq!(reloaded.data_slice(offset, 2).unwrap(), &[0xAB, 0xAB]);
    }

    #[test]
    fn test_append_section_without_room() {
        let mut loaded = File::from_mem(managed_image(0)).unwrap().into_image();
        loaded.layout.size_of_headers = loaded.layout.section_table_offset as u32 + 40;
        loaded.layout.sections[0].raw_offset = loaded.layout.size_of_headers;
        assert!(matches!(
            loaded.append_section(".patch", &[1], IMAGE_SCN_MEM_READ),
            Err(Unsupported(_))
        ));
    }

    #[test]
    fn test_memory_backend() {
        let data = vec![0xCC_u8, 0xBB, 0xAA];
        assert_eq!(Backend::len(&data), 3);
        assert_eq!(data.data_slice(1, 2).unwrap(), &[0xBB, 0xAA]);
        assert!(data.data_slice(2, 2).is_err());
        assert!(data.data_slice(usize::MAX, 1).is_err());
        let empty: &[u8] = &[];
        assert_eq!(data.data_slice(3, 0).unwrap(), empty);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(0, 0x200), 0);
        assert_eq!(align_up(1, 0x200), 0x200);
        assert_eq!(align_up(0x200, 0x200), 0x200);
        assert_eq!(align_up(5, 0), 5);
    }
}
