/// Chat plugin lifecycle and command dispatch.
pub mod bot;
/// Game operations on top of the session registry.
pub mod bridge;
/// Chat command grammar.
pub mod command;
/// Runtime configuration.
pub mod config;
/// Frame capture.
pub mod frame;
/// Rules engine vocabulary.
pub mod game;
/// The remote render host boundary.
pub mod host;
/// Sessions bound to conversations.
pub mod session;
