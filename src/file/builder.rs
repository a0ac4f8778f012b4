//! Builds a minimal PE32 managed image around one `.text` section.
//!
//! The produced image has a DOS header, a COFF header, a PE32 optional header and a single
//! `.text` section mapped at [`TEXT_RVA`]. When [`ImageBuilder::clr_header`] is set, data
//! directory 14 points at the CLR runtime header inside that section. It is what
//! [`crate::metadata::model::BinaryModel`] writes when it was not loaded from an existing
//! image, and what the tests and benchmarks use as a synthetic target.

use crate::{
    file::{align_up, io::write_le_to},
    metadata::cor20header::COR20_HEADER_SIZE,
};

/// RVA of the `.text` section of built images.
pub const TEXT_RVA: u32 = 0x2000;

const PE_OFFSET: u32 = 0x80;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x2000;
const SIZE_OF_HEADERS: u32 = 0x200;
const OPTIONAL_HEADER_SIZE: u16 = 0xE0;
const TEXT_SECTION: &[u8] = b".text";
const CLR_RUNTIME_HEADER_DIRECTORY: usize = 14;

const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const IMAGE_FILE_32BIT_MACHINE: u16 = 0x0100;
const IMAGE_FILE_DLL: u16 = 0x2000;
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;
const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

/// Builder for a single-section PE32 image.
///
/// # Examples
///
/// ```rust
/// use cilpatch::file::builder::ImageBuilder;
///
/// let image = ImageBuilder::new(vec![1, 2, 3]).build();
/// assert_eq!(&image[..2], b"MZ");
/// assert_eq!(image.len(), 0x400);
/// ```
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    text: Vec<u8>,
    clr_header: Option<u32>,
    dll: bool,
    characteristics: u16,
}

impl ImageBuilder {
    /// Starts an executable image whose `.text` section holds `text`.
    #[must_use]
    pub fn new(text: Vec<u8>) -> Self {
        ImageBuilder {
            text,
            clr_header: None,
            dll: false,
            characteristics: 0,
        }
    }

    /// Points data directory 14 at a CLR runtime header `offset` bytes into `.text`.
    #[must_use]
    pub fn clr_header(mut self, offset: u32) -> Self {
        self.clr_header = Some(offset);
        self
    }

    /// Marks the image as a library.
    #[must_use]
    pub fn dll(mut self, dll: bool) -> Self {
        self.dll = dll;
        self
    }

    /// Adds COFF characteristics bits on top of the defaults.
    #[must_use]
    pub fn characteristics(mut self, bits: u16) -> Self {
        self.characteristics |= bits;
        self
    }

    /// Lays out the image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let text_size = self.text.len() as u32;
        let raw_size = align_up(text_size, FILE_ALIGNMENT).max(FILE_ALIGNMENT);
        let size_of_image = align_up(TEXT_RVA + text_size.max(1), SECTION_ALIGNMENT);

        let mut characteristics =
            IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_32BIT_MACHINE | self.characteristics;
        if self.dll {
            characteristics |= IMAGE_FILE_DLL;
        }

        let mut image = Vec::with_capacity((SIZE_OF_HEADERS + raw_size) as usize);

        // DOS header
        image.extend_from_slice(b"MZ");
        image.resize(0x3C, 0);
        write_le_to(&mut image, PE_OFFSET);
        image.resize(PE_OFFSET as usize, 0);

        // COFF header
        image.extend_from_slice(b"PE\0\0");
        write_le_to(&mut image, IMAGE_FILE_MACHINE_I386);
        write_le_to::<u16>(&mut image, 1);
        write_le_to::<u32>(&mut image, 0); // TimeDateStamp
        write_le_to::<u32>(&mut image, 0); // PointerToSymbolTable
        write_le_to::<u32>(&mut image, 0); // NumberOfSymbols
        write_le_to(&mut image, OPTIONAL_HEADER_SIZE);
        write_le_to(&mut image, characteristics);

        // Optional header, standard fields
        write_le_to(&mut image, IMAGE_NT_OPTIONAL_HDR32_MAGIC);
        write_le_to::<u8>(&mut image, 8);
        write_le_to::<u8>(&mut image, 0);
        write_le_to(&mut image, raw_size); // SizeOfCode
        write_le_to::<u32>(&mut image, 0); // SizeOfInitializedData
        write_le_to::<u32>(&mut image, 0); // SizeOfUninitializedData
        write_le_to::<u32>(&mut image, 0); // AddressOfEntryPoint
        write_le_to(&mut image, TEXT_RVA); // BaseOfCode
        write_le_to::<u32>(&mut image, 0); // BaseOfData

        // Optional header, Windows fields
        write_le_to::<u32>(&mut image, 0x0040_0000);
        write_le_to(&mut image, SECTION_ALIGNMENT);
        write_le_to(&mut image, FILE_ALIGNMENT);
        write_le_to::<u16>(&mut image, 4); // MajorOperatingSystemVersion
        write_le_to::<u16>(&mut image, 0);
        write_le_to::<u16>(&mut image, 0); // MajorImageVersion
        write_le_to::<u16>(&mut image, 0);
        write_le_to::<u16>(&mut image, 4); // MajorSubsystemVersion
        write_le_to::<u16>(&mut image, 0);
        write_le_to::<u32>(&mut image, 0); // Win32VersionValue
        write_le_to(&mut image, size_of_image);
        write_le_to(&mut image, SIZE_OF_HEADERS);
        write_le_to::<u32>(&mut image, 0); // CheckSum
        write_le_to(&mut image, IMAGE_SUBSYSTEM_WINDOWS_CUI);
        write_le_to::<u16>(&mut image, 0); // DllCharacteristics
        write_le_to::<u32>(&mut image, 0x0010_0000);
        write_le_to::<u32>(&mut image, 0x1000);
        write_le_to::<u32>(&mut image, 0x0010_0000);
        write_le_to::<u32>(&mut image, 0x1000);
        write_le_to::<u32>(&mut image, 0); // LoaderFlags
        write_le_to::<u32>(&mut image, 16);
        let directories = image.len();
        image.resize(directories + 16 * 8, 0);
        if let Some(offset) = self.clr_header {
            let entry = directories + CLR_RUNTIME_HEADER_DIRECTORY * 8;
            image[entry..entry + 4].copy_from_slice(&(TEXT_RVA + offset).to_le_bytes());
            image[entry + 4..entry + 8].copy_from_slice(&COR20_HEADER_SIZE.to_le_bytes());
        }

        // Section table
        let mut name = [0u8; 8];
        name[..TEXT_SECTION.len()].copy_from_slice(TEXT_SECTION);
        image.extend_from_slice(&name);
        write_le_to(&mut image, text_size);
        write_le_to(&mut image, TEXT_RVA);
        write_le_to(&mut image, raw_size);
        write_le_to(&mut image, SIZE_OF_HEADERS);
        write_le_to::<u32>(&mut image, 0); // PointerToRelocations
        write_le_to::<u32>(&mut image, 0); // PointerToLinenumbers
        write_le_to::<u16>(&mut image, 0);
        write_le_to::<u16>(&mut image, 0);
        write_le_to(
            &mut image,
            IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
        );

        image.resize(SIZE_OF_HEADERS as usize, 0);
        image.extend_from_slice(&self.text);
        image.resize((SIZE_OF_HEADERS + raw_size) as usize, 0);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::io::read_le;

    #[test]
    fn test_headers() {
        let image = ImageBuilder::new(vec![0x42; 5]).dll(true).clr_header(0).build();
        assert_eq!(image.len(), 0x400);
        assert_eq!(read_le::<u32>(&image[0x3C..]).unwrap(), 0x80);
        assert_eq!(&image[0x80..0x84], b"PE\0\0");

        let characteristics = read_le::<u16>(&image[0x96..]).unwrap();
        assert_eq!(characteristics, 0x2102);
        assert_eq!(read_le::<u16>(&image[0x98..]).unwrap(), 0x10B);
        // Data directory 14
        assert_eq!(read_le::<u32>(&image[0x168..]).unwrap(), TEXT_RVA);
        assert_eq!(read_le::<u32>(&image[0x16C..]).unwrap(), 72);
        // Section table directly follows the optional header
        assert_eq!(&image[0x178..0x17D], b".text");
        assert_eq!(read_le::<u32>(&image[0x178 + 36..]).unwrap(), 0x6000_0020);
        assert_eq!(&image[0x200..0x205], &[0x42; 5]);
    }

    #[test]
    fn test_parses_with_goblin() {
        let image = ImageBuilder::new(vec![0; 0x345]).build();
        let pe = goblin::pe::PE::parse(&image).unwrap();
        assert!(!pe.is_64);
        assert_eq!(pe.sections.len(), 1);
        assert_eq!(pe.sections[0].virtual_size, 0x345);
        assert_eq!(pe.sections[0].size_of_raw_data, 0x400);
        let optional = pe.header.optional_header.unwrap();
        assert_eq!(optional.windows_fields.size_of_image, 0x4000);
        assert!(optional.data_directories.get_clr_runtime_header().is_none());
    }
}
