pub mod common;
pub mod disasm;
pub mod laa;
pub mod patch;
pub mod restore;
pub mod status;
