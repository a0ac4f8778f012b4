//! CLR 2.0 (Cor20) header, found through the `IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR` data
//! directory of a managed PE image.
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::{io::write_le_to, parser::Parser},
    Result,
};

/// Size of the header in bytes.
pub const COR20_HEADER_SIZE: u32 = 72;

/// `COMIMAGE_FLAGS_ILONLY`
pub const FLAGS_IL_ONLY: u32 = 0x0000_0001;

/// `COMIMAGE_FLAGS_STRONGNAMESIGNED`
pub const FLAGS_STRONG_NAME_SIGNED: u32 = 0x0000_0008;

/// The main header of CIL.
///
/// Only the size and the metadata directory are validated; everything else is kept as read
/// so the header can be written back unchanged apart from the fields the writer moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cor20Header {
    /// Size of header in bytes
    pub cb: u32,
    /// The minimum version of runtime required to run this program
    pub major_runtime_version: u16,
    /// The minor portion of the version
    pub minor_runtime_version: u16,
    /// RVA of the `MetaData`
    pub meta_data_rva: u32,
    /// Size of the `MetaData`
    pub meta_data_size: u32,
    /// Flags describing this runtime
    pub flags: u32,
    /// Token for the `MethodDef` or File of the entry point for the image
    pub entry_point_token: u32,
    /// RVA of implementation specific resources
    pub resource_rva: u32,
    /// Size of implementation specific resources
    pub resource_size: u32,
    /// RVA of the strong name signature
    pub strong_name_signature_rva: u32,
    /// Size of the strong name signature
    pub strong_name_signature_size: u32,
    /// Always 0
    pub code_manager_table_rva: u32,
    /// Always 0
    pub code_manager_table_size: u32,
    /// RVA of the VTable fixups
    pub vtable_fixups_rva: u32,
    /// Size of the VTable fixups
    pub vtable_fixups_size: u32,
    /// Always 0
    pub export_address_table_jmp_rva: u32,
    /// Always 0
    pub export_address_table_jmp_size: u32,
    /// Always 0
    pub managed_native_header_rva: u32,
    /// Always 0
    pub managed_native_header_size: u32,
}

impl Cor20Header {
    /// A header for an IL-only image whose metadata lives at `meta_data_rva`.
    #[must_use]
    pub fn new(meta_data_rva: u32, meta_data_size: u32) -> Self {
        Cor20Header {
            cb: COR20_HEADER_SIZE,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            meta_data_rva,
            meta_data_size,
            flags: FLAGS_IL_ONLY,
            entry_point_token: 0,
            resource_rva: 0,
            resource_size: 0,
            strong_name_signature_rva: 0,
            strong_name_signature_size: 0,
            code_manager_table_rva: 0,
            code_manager_table_size: 0,
            vtable_fixups_rva: 0,
            vtable_fixups_size: 0,
            export_address_table_jmp_rva: 0,
            export_address_table_jmp_size: 0,
            managed_native_header_rva: 0,
            managed_native_header_size: 0,
        }
    }

    /// Create a `Cor20Header` object from a sequence of bytes
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the data is too short, and
    /// [`crate::Error::Malformed`] if the size field is not 72 or the metadata directory is empty.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        if data.len() < COR20_HEADER_SIZE as usize {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(data);

        let cb = parser.read_le::<u32>()?;
        if cb != COR20_HEADER_SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected 72, got {}",
                cb
            ));
        }

        let major_runtime_version = parser.read_le::<u16>()?;
        let minor_runtime_version = parser.read_le::<u16>()?;
        let meta_data_rva = parser.read_le::<u32>()?;
        let meta_data_size = parser.read_le::<u32>()?;
        if meta_data_rva == 0 || meta_data_size == 0 {
            return Err(malformed_error!("CLR header has an empty metadata directory"));
        }

        Ok(Cor20Header {
            cb,
            major_runtime_version,
            minor_runtime_version,
            meta_data_rva,
            meta_data_size,
            flags: parser.read_le::<u32>()?,
            entry_point_token: parser.read_le::<u32>()?,
            resource_rva: parser.read_le::<u32>()?,
            resource_size: parser.read_le::<u32>()?,
            strong_name_signature_rva: parser.read_le::<u32>()?,
            strong_name_signature_size: parser.read_le::<u32>()?,
            code_manager_table_rva: parser.read_le::<u32>()?,
            code_manager_table_size: parser.read_le::<u32>()?,
            vtable_fixups_rva: parser.read_le::<u32>()?,
            vtable_fixups_size: parser.read_le::<u32>()?,
            export_address_table_jmp_rva: parser.read_le::<u32>()?,
            export_address_table_jmp_size: parser.read_le::<u32>()?,
            managed_native_header_rva: parser.read_le::<u32>()?,
            managed_native_header_size: parser.read_le::<u32>()?,
        })
    }

    /// Returns `true` if the image carries a strong name signature.
    #[must_use]
    pub fn is_strong_name_signed(&self) -> bool {
        self.flags & FLAGS_STRONG_NAME_SIGNED != 0 || self.strong_name_signature_size != 0
    }

    /// The 72 header bytes.
    #[must_use]
    pub fn write(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(COR20_HEADER_SIZE as usize);
        write_le_to(&mut buffer, self.cb);
        write_le_to(&mut buffer, self.major_runtime_version);
        write_le_to(&mut buffer, self.minor_runtime_version);
        for value in [
            self.meta_data_rva,
            self.meta_data_size,
            self.flags,
            self.entry_point_token,
            self.resource_rva,
            self.resource_size,
            self.strong_name_signature_rva,
            self.strong_name_signature_size,
            self.code_manager_table_rva,
            self.code_manager_table_size,
            self.vtable_fixups_rva,
            self.vtable_fixups_size,
            self.export_address_table_jmp_rva,
            self.export_address_table_jmp_size,
            self.managed_native_header_rva,
            self.managed_native_header_size,
        ] {
            write_le_to(&mut buffer, value);
        }
        buffer
    }
}
