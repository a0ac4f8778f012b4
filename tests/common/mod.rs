//! Fixtures shared by the integration tests: a small game executable with the methods the item
//! modification patch anchors to.

#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use cilpatch::{
    metadata::{
        method::{MethodAttributes, Parameter},
        typedef::{FieldAttributes, TypeAttributes},
    },
    prelude::*,
};

/// Builds a model with `Terraria.Main::LoadPlayers()` and `Terraria.Item::SetDefaults(int32, bool)`.
pub fn game(version: Version) -> BinaryModel {
    let mut model = BinaryModel::new("Terraria", version);
    model.import_assembly(&AssemblyRef::new("mscorlib", Version::new(4, 0, 0, 0)));

    let mut main = TypeDef::new(TypeAttributes::PUBLIC, "Terraria", "Main");
    main.fields.push(FieldDef::new(
        FieldAttributes::PUBLIC | FieldAttributes::STATIC,
        "netMode",
        TypeSig::Int32,
    ));
    let net_mode = FieldRef::new(main.reference(), "netMode", TypeSig::Int32);

    let mut body = MethodBody::new();
    body.instructions = vec![
        body.create(OpCode::LdcI40, Operand::None),
        body.create(OpCode::Stsfld, Operand::Field(net_mode)),
        body.create(OpCode::Ret, Operand::None),
    ];
    main.methods.push(
        MethodDef::new(
            MethodAttributes::PUBLIC | MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG,
            "LoadPlayers",
            MethodSig::new_static(TypeSig::Void, vec![]),
        )
        .with_body(body),
    );
    model.types.push(main);

    model.types.push(item(set_defaults_body));
    model
}

/// Builds the `Item` type with a `SetDefaults` body produced by `body`.
pub fn item(body: fn(&TypeDef) -> MethodBody) -> TypeDef {
    let mut item = TypeDef::new(TypeAttributes::PUBLIC, "Terraria", "Item");
    item.fields.push(FieldDef::new(FieldAttributes::PUBLIC, "type", TypeSig::Int32));
    let method_body = body(&item);
    item.methods.push(
        MethodDef::new(
            MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG,
            "SetDefaults",
            MethodSig::new_instance(TypeSig::Void, vec![TypeSig::Int32, TypeSig::Boolean]),
        )
        .with_parameters(vec![Parameter::new(1, "Type"), Parameter::new(2, "noMatCheck")])
        .with_body(method_body),
    );
    item
}

/// `if (Type != 0) { this.type = Type; } return;` with the branch aimed at the final `ret`.
pub fn set_defaults_body(item: &TypeDef) -> MethodBody {
    let field = FieldRef::new(item.reference(), "type", TypeSig::Int32);

    let mut body = MethodBody::new();
    let ret = body.create(OpCode::Ret, Operand::None);
    body.instructions = vec![
        body.create(OpCode::Ldarg1, Operand::Argument(1)),
        body.create(OpCode::BrfalseS, Operand::Target(ret.id())),
        body.create(OpCode::Ldarg0, Operand::Argument(0)),
        body.create(OpCode::Ldarg1, Operand::Argument(1)),
        body.create(OpCode::Stfld, Operand::Field(field)),
        ret,
    ];
    body.max_stack = 2;
    body
}

/// A `SetDefaults` body that always throws.
pub fn throwing_body(_item: &TypeDef) -> MethodBody {
    let mut body = MethodBody::new();
    body.instructions = vec![
        body.create(OpCode::Ldnull, Operand::None),
        body.create(OpCode::Throw, Operand::None),
    ];
    body
}

/// A game directory holding `Terraria.exe` and a separate helper directory.
pub struct Install {
    pub dir: tempfile::TempDir,
    pub target: PathBuf,
    pub helpers: PathBuf,
}

impl Install {
    /// Writes `model` as the game executable and provides the helper library.
    pub fn new(model: &BinaryModel) -> Install {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Terraria.exe");
        model.write(&target).unwrap();

        let helpers = dir.path().join("helpers");
        fs::create_dir(&helpers).unwrap();
        fs::write(helpers.join("ItemModification.dll"), b"helper library").unwrap();

        Install { dir, target, helpers }
    }

    /// A patcher with the default configuration, deploying from the helper directory.
    pub fn patcher(&self) -> Patcher {
        Patcher::new(&self.target, PatchConfig::default().with_helper_directory(&self.helpers))
    }

    pub fn game_dir(&self) -> &Path {
        self.dir.path()
    }
}
