//! Shared fixtures for the embedding tests
//!
//! The `game` program used throughout:
//!
//! ```text
//! class Game {
//!     static score: int = 0; static title: String = "Ember";
//!     static started: bool; static ticks: int; static hook: Function;
//!     static addPoints(n: int); static getScore(): int; static bonus(): int;
//!     static greet(who: String): String; static fail(); static nested(): int;
//!     static useHook(x): dynamic; static tick(); static scheduleTick(ms: float);
//! }
//! class Player { name: String; health: int; new(name, health);
//!                damage(n: int): int; describe(): String }
//! class Boss extends Player {}
//! main() { Game.started = true }
//! ```

#![allow(dead_code)]

use ember_core::{Module, ModuleBuilder, Opcode, TypeTag};
use ember_embed::{Runtime, RuntimeOptions};
use std::path::PathBuf;
use tempfile::TempDir;

/// The `game` program; `Game.bonus()` returns `bonus`, everything else is
/// identical between versions so one can patch the other.
pub fn game_module(bonus: i32) -> Module {
    let mut b = ModuleBuilder::new("game");

    let game = b.add_type("Game", None);
    let score = b.add_static(game, "score", TypeTag::Int);
    let title = b.add_static(game, "title", TypeTag::String);
    let started = b.add_static(game, "started", TypeTag::Bool);
    let ticks = b.add_static(game, "ticks", TypeTag::Int);
    let hook = b.add_static(game, "hook", TypeTag::Function);

    let ember = b.intern("Ember");
    let hello = b.intern("Hello, ");
    let boom = b.intern("boom");
    let colon = b.intern(": ");

    b.add_static_init(
        game,
        0,
        vec![
            Opcode::ConstI32(0),
            Opcode::SetStatic { ty: game, slot: score },
            Opcode::ConstStr(ember),
            Opcode::SetStatic { ty: game, slot: title },
            Opcode::ReturnVoid,
        ],
    );
    b.add_static_method(
        game,
        "addPoints",
        &[TypeTag::Int],
        TypeTag::Void,
        1,
        vec![
            Opcode::GetStatic { ty: game, slot: score },
            Opcode::LoadLocal(0),
            Opcode::Add,
            Opcode::SetStatic { ty: game, slot: score },
            Opcode::ReturnVoid,
        ],
    );
    let get_score = b.add_static_method(
        game,
        "getScore",
        &[],
        TypeTag::Int,
        0,
        vec![Opcode::GetStatic { ty: game, slot: score }, Opcode::Return],
    );
    b.add_static_method(game, "bonus", &[], TypeTag::Int, 0, vec![Opcode::ConstI32(bonus), Opcode::Return]);
    b.add_static_method(
        game,
        "greet",
        &[TypeTag::String],
        TypeTag::String,
        1,
        vec![Opcode::ConstStr(hello), Opcode::LoadLocal(0), Opcode::Concat, Opcode::Return],
    );
    b.add_static_method(game, "fail", &[], TypeTag::Void, 0, vec![Opcode::ConstStr(boom), Opcode::Throw]);
    b.add_static_method(
        game,
        "nested",
        &[],
        TypeTag::Int,
        0,
        vec![Opcode::Call { func: get_score, argc: 0 }, Opcode::Return],
    );
    b.add_static_method(
        game,
        "useHook",
        &[TypeTag::Dynamic],
        TypeTag::Dynamic,
        1,
        vec![
            Opcode::GetStatic { ty: game, slot: hook },
            Opcode::LoadLocal(0),
            Opcode::CallClosure { argc: 1 },
            Opcode::Return,
        ],
    );
    let tick = b.add_static_method(
        game,
        "tick",
        &[],
        TypeTag::Void,
        0,
        vec![
            Opcode::GetStatic { ty: game, slot: ticks },
            Opcode::ConstI32(1),
            Opcode::Add,
            Opcode::SetStatic { ty: game, slot: ticks },
            Opcode::ReturnVoid,
        ],
    );
    b.add_static_method(
        game,
        "scheduleTick",
        &[TypeTag::Float],
        TypeTag::Void,
        1,
        vec![Opcode::MakeClosure(tick), Opcode::LoadLocal(0), Opcode::Schedule, Opcode::ReturnVoid],
    );

    let player = b.add_type("Player", None);
    let name = b.add_field(player, "name", TypeTag::String);
    let health = b.add_field(player, "health", TypeTag::Int);
    b.add_constructor(
        player,
        &[TypeTag::String, TypeTag::Int],
        3,
        vec![
            Opcode::LoadLocal(0),
            Opcode::LoadLocal(1),
            Opcode::SetField(name),
            Opcode::LoadLocal(0),
            Opcode::LoadLocal(2),
            Opcode::SetField(health),
            Opcode::ReturnVoid,
        ],
        true,
    );
    b.add_method(
        player,
        "damage",
        &[TypeTag::Int],
        TypeTag::Int,
        2,
        vec![
            Opcode::LoadLocal(0),
            Opcode::LoadLocal(0),
            Opcode::GetField(health),
            Opcode::LoadLocal(1),
            Opcode::Sub,
            Opcode::SetField(health),
            Opcode::LoadLocal(0),
            Opcode::GetField(health),
            Opcode::Return,
        ],
    );
    b.add_method(
        player,
        "describe",
        &[],
        TypeTag::String,
        1,
        vec![
            Opcode::LoadLocal(0),
            Opcode::GetField(name),
            Opcode::ConstStr(colon),
            Opcode::Concat,
            Opcode::LoadLocal(0),
            Opcode::GetField(health),
            Opcode::Concat,
            Opcode::Return,
        ],
    );
    b.add_type("Boss", Some(player));

    let main = b.add_function(
        "main",
        &[],
        TypeTag::Void,
        0,
        vec![
            Opcode::ConstBool(true),
            Opcode::SetStatic { ty: game, slot: started },
            Opcode::ReturnVoid,
        ],
    );
    b.set_entry(main);

    b.build().unwrap()
}

/// Encoded image of [`game_module`]
pub fn game_image(bonus: i32) -> Vec<u8> {
    game_module(bonus).encode().unwrap()
}

/// Write an image into `dir` and return its path
pub fn write_image(dir: &TempDir, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, image).unwrap();
    path
}

/// Initialized runtime with the game program loaded, entry not yet run
pub fn loaded(options: RuntimeOptions) -> Runtime {
    let mut rt = Runtime::new(options);
    rt.initialize(&["game"]).unwrap();
    rt.load_module(game_module(1)).unwrap();
    rt
}

/// Runtime with the game program loaded and its entry point run
pub fn started(options: RuntimeOptions) -> Runtime {
    let mut rt = loaded(options);
    rt.run_entry().unwrap();
    rt
}
