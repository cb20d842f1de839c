use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TreeDumpCli {
    None,
    Before,
    After,
    Full,
}

#[derive(Parser)]
#[command(name = "lapdec",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Log pipeline stages to stderr
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles an Emacs Lisp LAP listing
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a LAP listing file
    File {
        /// Path to the LAP listing
        path: PathBuf,

        /// Print the annotated instruction listing instead of source
        #[arg(short, long, default_value_t = false)]
        assembly: bool,

        /// Print the basic blocks of each function
        #[arg(long, default_value_t = false)]
        blocks: bool,

        /// Print the grammar reductions of each parse
        #[arg(short, long, default_value_t = false)]
        grammar: bool,

        /// Print the syntax tree before and/or after the transform
        #[arg(long, value_enum, default_value_t = TreeDumpCli::None)]
        tree: TreeDumpCli,

        /// Same as --tree after
        #[arg(short = 't', conflicts_with_all = ["tree", "tree_full"], default_value_t = false)]
        tree_after: bool,

        /// Same as --tree full
        #[arg(short = 'T', conflicts_with = "tree", default_value_t = false)]
        tree_full: bool,
    },
}
