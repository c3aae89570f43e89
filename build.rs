// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("revtree")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Revtree Contributors")
        .about("Embedded document store with MVCC and peer replication")
        .subcommand_required(false)
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .global(true)
                .default_value("./revtree-data")
                .help("Store root directory"),
        )
        .subcommand(Command::new("init").about("Initialize a store at --root"))
        .subcommand(
            Command::new("put")
                .about("Insert a new document (JSON body from stdin)")
                .arg(Arg::new("doc_id").help("Document id (generated if omitted)")),
        )
        .subcommand(
            Command::new("update")
                .about("Update an existing document (JSON body from stdin)")
                .arg(Arg::new("doc_id").required(true))
                .arg(Arg::new("rev").required(true).help("Current leaf revision id")),
        )
        .subcommand(
            Command::new("get")
                .about("Fetch a document's current winning revision")
                .arg(Arg::new("doc_id").required(true))
                .arg(
                    Arg::new("attachments")
                        .long("attachments")
                        .action(clap::ArgAction::SetTrue)
                        .help("Inline attachment bodies as base64 rather than stubs"),
                ),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete (tombstone) a document")
                .arg(Arg::new("doc_id").required(true))
                .arg(Arg::new("rev").required(true)),
        )
        .subcommand(
            Command::new("conflicts")
                .about("List documents with an open conflict")
                .arg(Arg::new("doc_id").required(true)),
        )
        .subcommand(
            Command::new("resolve")
                .about("Resolve a conflicted document (merged JSON body from stdin)")
                .arg(Arg::new("doc_id").required(true)),
        )
        .subcommand(
            Command::new("query")
                .about("Run a selector query (JSON selector from stdin)")
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .default_value("100")
                        .help("Maximum results to return"),
                ),
        )
        .subcommand(
            Command::new("create-index")
                .about("Create a secondary index")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("fields").required(true).help("Comma-separated field paths"))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .value_parser(["json", "text"])
                        .default_value("json"),
                ),
        )
        .subcommand(
            Command::new("drop-index")
                .about("Drop a secondary index")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(Command::new("reindex").about("Rebuild every index from current winning revisions"))
        .subcommand(Command::new("compact").about("Compact revision history"))
        .subcommand(Command::new("gc").about("Garbage-collect unreferenced attachment blobs"))
        .subcommand(
            Command::new("pull")
                .about("Pull changes from a remote peer")
                .arg(Arg::new("remote_url").required(true)),
        )
        .subcommand(
            Command::new("push")
                .about("Push changes to a remote peer")
                .arg(Arg::new("remote_url").required(true)),
        )
        .subcommand(
            Command::new("sync")
                .about("Pull then push against a remote peer")
                .arg(Arg::new("remote_url").required(true)),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("revtree.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
