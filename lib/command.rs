use crate::game::ExportFormat;
use clap::{Args, Parser};
use derive_more::{Display, Error, From};
use std::str::FromStr;

/// The reason why parsing a [`Command`] failed.
///
/// Displays as clap's own usage message, which makes a reasonable reply.
#[derive(Debug, Display, Error, From)]
#[display(fmt = "{}", _0)]
pub struct ParseCommandError(#[error(not(source))] clap::Error);

/// A chat command.
#[derive(Debug, Clone, Eq, PartialEq, Parser)]
#[clap(name = "5dc", disable_version_flag = true)]
pub enum Command {
    /// Creates a game, optionally from a starting position.
    Start(Start),

    /// Shows the board of the game in progress.
    Show(Show),

    /// Plays a move in the game in progress.
    Move(Move),

    /// Exports the game in progress.
    Export(Export),

    /// Creates a game from an exported one.
    Import(Import),

    /// Lists the games in progress.
    List,

    /// Ends the game in progress.
    End(End),

    /// Shows the last captured frame.
    #[clap(hide = true)]
    Debug,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct Start {
    /// Replace the game in progress.
    #[clap(short = 'o', long = "override")]
    pub replace: bool,

    /// Frame the full board.
    #[clap(short, long)]
    pub full: bool,

    /// The variant to play.
    #[clap(short, long)]
    pub variant: Option<String>,

    /// The starting position.
    pub position: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct Show {
    /// Frame the full board.
    #[clap(short, long)]
    pub full: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct Move {
    /// Frame the full board.
    #[clap(short, long)]
    pub full: bool,

    /// The move in 5D notation.
    pub input: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct Export {
    /// The export format.
    #[clap(short = 'F', long, value_enum)]
    pub format: Option<ExportFormat>,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct Import {
    /// Replace the game in progress.
    #[clap(short = 'o', long = "override")]
    pub replace: bool,

    /// Frame the full board.
    #[clap(short, long)]
    pub full: bool,

    /// The variant to play.
    #[clap(short, long)]
    pub variant: Option<String>,

    /// The exported game.
    pub content: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Args)]
pub struct End {
    /// End every game.
    #[clap(short, long)]
    pub all: bool,
}

/// Options that take a separate value, as in `--variant princess`.
const VALUED: [&str; 4] = ["-v", "--variant", "-F", "--format"];

/// Splits a chat line into arguments.
///
/// Leading options are split on whitespace, whereas everything after them is kept verbatim as a
/// single positional argument, so that moves and exported games survive intact.
fn split(line: &str) -> Vec<&str> {
    let line = line.trim();
    let (name, tail) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let mut args = vec![name.strip_prefix("5dc.").unwrap_or(name)];
    let mut rest = tail.trim_start();

    while rest.starts_with('-') {
        let (option, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        rest = tail.trim_start();

        if option == "--" {
            break;
        }

        args.push(option);

        if VALUED.contains(&option) && !rest.is_empty() {
            let (value, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            args.push(value);
            rest = tail.trim_start();
        }
    }

    if !rest.is_empty() {
        args.push("--");
        args.push(rest);
    }

    args
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args = std::iter::once("5dc").chain(split(s));
        Ok(Command::try_parse_from(args)?)
    }
}
