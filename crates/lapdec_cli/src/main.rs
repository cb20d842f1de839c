use clap::{CommandFactory, Parser};
use env_logger::Target;
use log::LevelFilter;

use crate::cli::{Cli, DecompileCommand, TopLevel, TreeDumpCli};

mod cli;

fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .filter_module("lapdec_lib", level)
        .parse_default_env()
        .target(Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File {
                path,
                assembly,
                blocks,
                grammar,
                tree,
                tree_after,
                tree_full,
            } => {
                let tree = match (tree_full, tree_after, tree) {
                    (true, _, _) | (_, _, TreeDumpCli::Full) => lapdec_lib::TreeDump::Full,
                    (_, true, _) | (_, _, TreeDumpCli::After) => lapdec_lib::TreeDump::After,
                    (_, _, TreeDumpCli::Before) => lapdec_lib::TreeDump::Before,
                    (_, _, TreeDumpCli::None) => lapdec_lib::TreeDump::None,
                };
                let options = lapdec_lib::DecompileOptions {
                    mode: if assembly {
                        lapdec_lib::DecompileMode::Assembly
                    } else {
                        lapdec_lib::DecompileMode::Source
                    },
                    show_blocks: blocks,
                    show_grammar: grammar,
                    tree,
                };
                match std::fs::read_to_string(&path) {
                    Ok(listing) => match lapdec_lib::decompile_with_options(&listing, &options) {
                        Ok(out) => {
                            print!("{}", out.text);
                            if !out.failures.is_empty() {
                                eprintln!("{} function(s) failed to decompile", out.failures.len());
                                std::process::exit(1);
                            }
                        }
                        Err(e) => {
                            eprintln!("decompile error: {e}");
                            std::process::exit(1);
                        }
                    },
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let _ = Cli::command().print_help();
        }
    }
}
