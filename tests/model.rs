//! Loading, editing and writing binaries through the model.

mod common;

use std::fs;

use cilpatch::{
    file::builder::ImageBuilder,
    header::{set_large_address_aware, IMAGE_FILE_LARGE_ADDRESS_AWARE},
    metadata::{cor20header::Cor20Header, root::Root},
    prelude::*,
};
use common::game;

#[test]
fn unmodified_model_writes_identical_bytes() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Terraria.exe");
    game(Version::new(1, 3, 5, 3)).write(&path)?;
    let original = fs::read(&path).unwrap();

    let model = BinaryModel::load(&path)?;
    assert!(model.has_image());
    assert_eq!(model.to_bytes()?, original);

    // The native header is carried over untouched.
    set_large_address_aware(&path)?;
    let flagged = fs::read(&path).unwrap();
    assert_eq!(BinaryModel::load(&path)?.to_bytes()?, flagged);
    Ok(())
}

#[test]
fn edits_survive_a_reload() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Terraria.exe");
    game(Version::new(1, 3, 5, 3)).write(&path)?;

    let mut model = BinaryModel::load(&path)?;
    let counter = model.add_static_field("Terraria.Main", "playerCount", TypeSig::Int32)?;
    let body = model.method_mut("Main", "LoadPlayers", 0)?.body_mut().unwrap();
    let end = body.insert(
        0,
        [
            Instruction::load_int(255),
            Instruction::new(OpCode::Stsfld, Operand::Field(counter.clone())),
        ],
    );
    assert_eq!(end, 2);
    model.write(&path)?;

    let reloaded = BinaryModel::load(&path)?;
    assert!(reloaded.has_field("Main", "playerCount"));
    let body = reloaded.method("Main", "LoadPlayers", 0)?.body().unwrap();
    assert_eq!(body.len(), 5);
    assert_eq!(body.instructions[0].operand.int_value(), Some(255));
    assert_eq!(body.instructions[1].operand.field(), Some(&counter));
    assert_eq!(body.instructions[4].opcode, OpCode::Ret);

    // `playerCount` took the `Field` row of `Item::type`; the untouched body follows it.
    let item_type = reloaded.type_def("Item")?.field_ref("type").unwrap();
    let set_defaults = reloaded.method("Item", "SetDefaults", 2)?;
    assert!(!set_defaults.is_dirty());
    assert_eq!(set_defaults.body().unwrap().instructions[4].operand.field(), Some(&item_type));

    // Writing the reloaded model again changes nothing.
    assert_eq!(reloaded.to_bytes()?, fs::read(&path).unwrap());
    Ok(())
}

#[test]
fn metadata_root_is_reached_through_the_clr_header() -> Result<()> {
    let image = game(Version::new(1, 3, 5, 3)).to_bytes()?;
    let pe = goblin::pe::PE::parse(&image).unwrap();
    let optional = pe.header.optional_header.unwrap();
    let Some(clr) = optional.data_directories.get_clr_runtime_header() else {
        panic!("data directory 14 is empty");
    };
    assert_eq!(clr.size, 72);

    let text = &pe.sections[0];
    let offset = |rva: u32| (rva - text.virtual_address + text.pointer_to_raw_data) as usize;
    let cor20 = Cor20Header::read(&image[offset(clr.virtual_address)..])?;
    let metadata = &image[offset(cor20.meta_data_rva)..][..cor20.meta_data_size as usize];
    assert_eq!(&metadata[..4], b"BSJB");

    let root = Root::read(metadata)?;
    for name in ["#~", "#Strings", "#US", "#GUID", "#Blob"] {
        assert!(root.stream(name).is_some(), "missing {name}");
    }
    Ok(())
}

#[test]
fn rewriting_appends_a_section_and_keeps_the_rest() -> Result<()> {
    let original = game(Version::new(1, 3, 5, 3)).to_bytes()?;
    let mut model = BinaryModel::from_mem(original.clone())?;
    // `Item` is the last type, so no loaded row moves.
    model.add_static_field("Item", "maxStack", TypeSig::Int32)?;
    let body = model.method_mut("Main", "LoadPlayers", 0)?.body_mut().unwrap();
    body.insert(0, [Instruction::simple(OpCode::Nop)]);
    let patched = model.to_bytes()?;

    let before = goblin::pe::PE::parse(&original).unwrap();
    let after = goblin::pe::PE::parse(&patched).unwrap();
    assert_eq!(after.sections.len(), before.sections.len() + 1);
    assert_eq!(after.sections[1].name().unwrap(), ".patch");

    // Inside the original section only the CLR header changed.
    let text = &before.sections[0];
    let start = text.pointer_to_raw_data as usize;
    let end = start + text.size_of_raw_data as usize;
    let optional = before.header.optional_header.unwrap();
    let Some(clr) = optional.data_directories.get_clr_runtime_header() else {
        panic!("data directory 14 is empty");
    };
    let cor20 = start + (clr.virtual_address - text.virtual_address) as usize;
    let changed: Vec<usize> = (start..end).filter(|&i| original[i] != patched[i]).collect();
    assert!(!changed.is_empty());
    assert!(changed.iter().all(|i| (cor20..cor20 + 72).contains(i)));
    assert_eq!(&patched[end..original.len()], &original[end..]);

    let reloaded = BinaryModel::from_mem(patched)?;
    assert_eq!(reloaded.type_refs(), model.type_refs());
    assert_eq!(reloaded.assembly_refs(), model.assembly_refs());
    assert!(reloaded.has_field("Item", "maxStack"));
    assert!(!reloaded.method("Item", "SetDefaults", 2)?.is_dirty());
    let load_players = reloaded.method("Main", "LoadPlayers", 0)?.body().unwrap();
    assert_eq!(load_players.instructions[0].opcode, OpCode::Nop);
    Ok(())
}

#[test]
fn scanning_a_loaded_body() -> Result<()> {
    let model = BinaryModel::from_mem(game(Version::new(1, 3, 5, 3)).to_bytes()?)?;
    let body = model.method("Terraria.Item", "SetDefaults", 2)?.body().unwrap();

    let store_type = Pattern::new(vec![
        OperandCheck::family(SlotFamily::Ldarg),
        OperandCheck::family(SlotFamily::Ldarg),
        OperandCheck::with(OpCode::Stfld, Predicate::FieldContains("Terraria.Item::type".into())),
    ]);
    assert_eq!(scan(body, &store_type, 0, 0, false), Some(2));
    assert_eq!(scan(body, &store_type, 0, 0, true), Some(5));
    assert_eq!(scan(body, &store_type, 0, 3, false), None);

    let guarded = Pattern::new(vec![
        OperandCheck::new(OpCode::BrfalseS),
        OperandCheck::skip_indefinite(),
        OperandCheck::new(OpCode::Ret),
    ]);
    assert_eq!(scan(body, &guarded, 0, 0, false), Some(1));
    assert_eq!(scan(body, &guarded, 0, 0, true), Some(6));
    assert_eq!(scan_opcodes(body, &[OpCode::Stfld, OpCode::Ret], 0, 0, false), Some(4));
    Ok(())
}

#[test]
fn lookups_report_missing_definitions() {
    let model = game(Version::new(1, 3, 5, 3));
    assert!(model.find_type("Terraria.Player").is_none());
    assert!(matches!(
        model.method("Main", "LoadPlayers", 1),
        Err(Error::DefinitionNotFound { .. })
    ));
    assert!(matches!(
        model.field("Item", "stack"),
        Err(Error::DefinitionNotFound { .. })
    ));
    assert!(model.find_method("Item", "SetDefaults", 2, Some(false)).is_some());
    assert!(model.find_method("Item", "SetDefaults", 2, Some(true)).is_none());
}

#[test]
fn rejects_unmanaged_input() {
    assert!(matches!(BinaryModel::from_mem(Vec::new()), Err(Error::Empty)));
    assert!(matches!(
        BinaryModel::from_mem(b"not an executable at all".to_vec()),
        Err(Error::BinaryFormat(_))
    ));
    // A native image without a CLR header.
    let image = ImageBuilder::new(vec![0xAB; 64]).build();
    assert!(matches!(BinaryModel::from_mem(image), Err(Error::BinaryFormat(_))));
    // A CLR header pointing at garbage.
    let mut text = vec![0xAB; 64];
    text[..4].copy_from_slice(&72u32.to_le_bytes());
    text.resize(72, 0);
    let image = ImageBuilder::new(text).clr_header(0).build();
    assert!(BinaryModel::from_mem(image).is_err());
}

#[test]
fn header_fix_up_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("game.exe");
    fs::write(&exe, ImageBuilder::new(vec![0; 16]).build()).unwrap();
    let before = fs::read(&exe).unwrap();

    assert_eq!(set_large_address_aware(&exe)?, HeaderPatch::Applied);
    let after = fs::read(&exe).unwrap();
    assert_eq!(before.len(), after.len());
    let changed: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
    assert_eq!(changed.len(), 1);
    assert_eq!(after[changed[0]] & IMAGE_FILE_LARGE_ADDRESS_AWARE as u8, 0x20);

    assert_eq!(set_large_address_aware(&exe)?, HeaderPatch::AlreadySet);
    assert_eq!(fs::read(&exe).unwrap(), after);

    let text = dir.path().join("readme.txt");
    fs::write(&text, "plain text").unwrap();
    assert_eq!(set_large_address_aware(&text)?, HeaderPatch::NotExecutable);
    assert_eq!(fs::read(&text).unwrap(), b"plain text");
    Ok(())
}
