//! End-to-end patch runs against a generated game executable.
//!
//! Each test writes a fresh executable into a temporary directory, runs the patcher on it and
//! inspects the file afterwards by loading it again.

mod common;

use std::fs;

use cilpatch::{
    header::is_large_address_aware,
    metadata::references::ResolutionScope,
    patcher::PatchStep,
    prelude::*,
};
use common::{game, item, throwing_body, Install};

const GAME_VERSION: Version = Version::new(1, 3, 5, 3);

fn helper_call(instruction: &Instruction) -> &MethodRef {
    match &instruction.operand {
        Operand::Method(method) if instruction.opcode == OpCode::Call => method,
        other => panic!("expected a call, found {} {other:?}", instruction.opcode),
    }
}

#[test]
fn patch_then_refuse_second_run() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let patcher = install.patcher();
    assert!(!patcher.is_patched()?);

    let report = patcher.patch()?;
    assert_eq!(report.anchors.len(), 2);
    assert!(report.backup_created);
    assert_eq!(report.header, Some(HeaderPatch::Applied));
    assert_eq!(
        report.copied_files,
        vec![install.game_dir().join("ItemModification.dll")]
    );
    assert_eq!(
        fs::read(install.game_dir().join("ItemModification.dll")).unwrap(),
        b"helper library"
    );
    assert!(patcher.has_backup());
    assert!(patcher.is_patched()?);

    let patched = fs::read(&install.target).unwrap();
    let error = patcher.patch().unwrap_err();
    assert!(matches!(error, Error::AlreadyPatched { ref marker, .. } if marker == "ItemModificationPatched"));
    assert_eq!(error.step(), Some(PatchStep::MarkerCheck));
    assert_eq!(fs::read(&install.target).unwrap(), patched);
    Ok(())
}

#[test]
fn injected_calls_reach_the_helper_library() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let report = install.patcher().patch()?;
    assert_eq!(report.anchors[0].index, 0);
    assert_eq!(report.anchors[0].inserted, 1);
    assert_eq!(report.anchors[1].index, 5);
    assert_eq!(report.anchors[1].inserted, 3);

    let model = BinaryModel::load(&install.target)?;
    assert!(model.assembly_refs().iter().any(|a| a.name == "ItemModification"));
    assert!(model.field("Main", "ItemModificationPatched")?.is_static());

    let load_players = model.method("Main", "LoadPlayers", 0)?.body().unwrap();
    assert_eq!(load_players.len(), 4);
    let setup = helper_call(&load_players.instructions[0]);
    assert_eq!(setup.name, "OnSetupModifications");
    assert_eq!(
        setup.declaring_type.scope,
        ResolutionScope::Assembly("ItemModification".into())
    );
    assert_eq!(setup.declaring_type.full_name(), "ItemModification.ItemModifier");
    assert!(setup.signature.params.is_empty());

    let set_defaults = model.method("Item", "SetDefaults", 2)?.body().unwrap();
    let opcodes: Vec<OpCode> = set_defaults.instructions.iter().map(|i| i.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            OpCode::Ldarg1,
            OpCode::BrfalseS,
            OpCode::Ldarg0,
            OpCode::Ldarg1,
            OpCode::Stfld,
            OpCode::Ldarg0,
            OpCode::Call,
            OpCode::Ret,
        ]
    );
    let on_set = helper_call(&set_defaults.instructions[6]);
    assert_eq!(on_set.name, "OnSetItemDefaults");
    assert!(!on_set.signature.has_this);
    assert_eq!(
        on_set.signature.params,
        vec![TypeSig::Class(model.type_def("Item")?.reference())]
    );

    // The early exit now runs the hook as well.
    let Operand::Target(target) = set_defaults.instructions[1].operand else {
        panic!("brfalse.s lost its target");
    };
    assert_eq!(set_defaults.index_of(target), Some(5));
    Ok(())
}

#[test]
fn patched_hook_is_found_by_pattern() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    install.patcher().patch()?;

    let model = BinaryModel::load(&install.target)?;
    let body = model.method("Item", "SetDefaults", 2)?.body().unwrap();
    let pattern = Pattern::new(vec![
        OperandCheck::family(SlotFamily::Ldarg),
        OperandCheck::with(OpCode::Call, Predicate::MethodContains("ItemModifier::OnSetItemDefaults".into())),
        OperandCheck::new(OpCode::Ret),
    ]);
    assert_eq!(scan(body, &pattern, 0, 0, false), Some(5));
    assert_eq!(scan(body, &pattern, 0, 0, true), Some(8));
    assert_eq!(scan(body, &pattern, 1, 0, false), None);
    Ok(())
}

#[test]
fn restore_brings_back_the_original() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let original = fs::read(&install.target).unwrap();
    let patcher = install.patcher();

    patcher.patch()?;
    assert_ne!(fs::read(&install.target).unwrap(), original);

    patcher.restore()?;
    assert_eq!(fs::read(&install.target).unwrap(), original);
    assert!(!patcher.is_patched()?);
    assert!(patcher.has_backup());

    let report = patcher.restore_and_patch()?;
    assert!(!report.backup_created);
    assert_eq!(report.anchors.len(), 2);
    assert!(patcher.is_patched()?);
    Ok(())
}

#[test]
fn restore_without_backup() {
    let install = Install::new(&game(GAME_VERSION));
    let patcher = install.patcher();

    assert!(matches!(patcher.restore(), Err(Error::BackupMissing(path)) if path == patcher.backup_path()));
    assert!(matches!(patcher.restore_and_patch(), Err(Error::BackupMissing(_))));
    assert!(matches!(patcher.backup_is_older(), Err(Error::BackupMissing(_))));
    assert!(!patcher.is_patched().unwrap());
}

#[test]
fn missing_anchor_leaves_target_untouched() {
    let mut model = game(GAME_VERSION);
    model.types.retain(|t| t.name != "Item");
    let install = Install::new(&model);
    let original = fs::read(&install.target).unwrap();
    let patcher = install.patcher();

    let error = patcher.patch().unwrap_err();
    match &error {
        Error::AnchorNotFound { anchor, step, .. } => {
            assert_eq!(anchor, "Item::SetDefaults/2");
            assert_eq!(*step, PatchStep::Inject);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(fs::read(&install.target).unwrap(), original);
    assert!(!patcher.is_patched().unwrap());
    assert!(!install.game_dir().join("ItemModification.dll").exists());
}

#[test]
fn anchor_without_final_return() {
    let mut model = game(GAME_VERSION);
    model.types.retain(|t| t.name != "Item");
    model.types.push(item(throwing_body));
    let install = Install::new(&model);
    let original = fs::read(&install.target).unwrap();

    let error = install.patcher().patch().unwrap_err();
    assert!(matches!(error, Error::AnchorShape { step: PatchStep::Inject, .. }), "{error}");
    assert!(error.to_string().contains("throw"));
    assert_eq!(fs::read(&install.target).unwrap(), original);
}

#[test]
fn pattern_injection() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let mut config = PatchConfig::default().with_helper_directory(&install.helpers);
    config.hooks.truncate(1);
    config.hooks[0] = HookSpec {
        anchor: AnchorSpec::new("Terraria.Item", "SetDefaults", 2),
        helper_method: "OnTypeAssigned".into(),
        injection: Injection::AtPattern {
            pattern: Pattern::new(vec![
                OperandCheck::family(SlotFamily::Ldarg),
                OperandCheck::with(OpCode::Stfld, Predicate::FieldContains("Terraria.Item::type".into())),
            ]),
            occurrence: 0,
            at_end: true,
        },
    };

    let report = Patcher::new(&install.target, config).patch()?;
    assert_eq!(report.anchors[0].index, 5);
    assert_eq!(report.anchors[0].inserted, 1);

    let model = BinaryModel::load(&install.target)?;
    let body = model.method("Item", "SetDefaults", 2)?.body().unwrap();
    assert_eq!(helper_call(&body.instructions[5]).name, "OnTypeAssigned");
    assert_eq!(body.instructions[6].opcode, OpCode::Ret);
    Ok(())
}

#[test]
fn header_patch_can_be_disabled() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let mut config = PatchConfig::default().with_helper_directory(&install.helpers);
    config.large_address_aware = false;
    config.required_files.clear();

    let report = Patcher::new(&install.target, config).patch()?;
    assert_eq!(report.header, None);
    assert!(report.copied_files.is_empty());
    assert_eq!(is_large_address_aware(&install.target)?, Some(false));
    Ok(())
}

#[test]
fn missing_helper_file_fails_after_write() {
    let install = Install::new(&game(GAME_VERSION));
    fs::remove_file(install.helpers.join("ItemModification.dll")).unwrap();

    let error = install.patcher().patch().unwrap_err();
    assert_eq!(error.step(), Some(PatchStep::CopyRequiredFiles));
    assert!(install.patcher().is_patched().unwrap());
}

#[test]
fn status_and_backup_age() -> Result<()> {
    let install = Install::new(&game(GAME_VERSION));
    let patcher = install.patcher();

    let before = patcher.status()?;
    assert_eq!(before.version, GAME_VERSION);
    assert!(!before.patched);
    assert_eq!(before.backup, None);
    assert_eq!(before.large_address_aware, Some(false));

    patcher.patch()?;
    let after = patcher.status()?;
    assert!(after.patched);
    assert_eq!(after.backup, Some(patcher.backup_path()));
    assert_eq!(after.large_address_aware, Some(true));
    assert!(!patcher.backup_is_older()?);

    // A game update replaces the executable; the backup is now stale.
    game(Version::new(1, 4, 0, 0)).write(&install.target)?;
    assert!(patcher.backup_is_older()?);
    Ok(())
}
