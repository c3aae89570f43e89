use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use revtree::config::{CancellationToken, ReplicatorOptions, StoreOptions};
use revtree::query::planner::IndexKind;
use revtree::revision::model::{DocId, RevId};
use revtree::store::Datastore;
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "revtree")]
#[command(author, version, about = "Embedded document store with MVCC and peer replication", long_about = None)]
struct Cli {
    /// Store root directory
    #[arg(short, long, global = true, default_value = "./revtree-data")]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a store at --root
    Init,
    /// Insert a new document. Body is read as JSON from stdin.
    Put {
        /// Document id (generated if omitted)
        doc_id: Option<String>,
    },
    /// Update an existing document. Body is read as JSON from stdin.
    Update {
        doc_id: String,
        /// Current leaf revision id, e.g. "2-abc123"
        rev: String,
    },
    /// Fetch a document's current winning revision
    Get {
        doc_id: String,
        /// Inline attachment bodies as base64 rather than stubs
        #[arg(long)]
        attachments: bool,
    },
    /// Delete (tombstone) a document
    Delete { doc_id: String, rev: String },
    /// List documents with an open conflict
    Conflicts { doc_id: String },
    /// Resolve a conflicted document. Merged body is read as JSON from stdin.
    Resolve { doc_id: String },
    /// Run a selector query. Selector is read as JSON from stdin.
    Query {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Comma-separated sort fields, e.g. "age,name:desc". Every field
        /// must be covered by the index chosen for the query.
        #[arg(long)]
        sort: Option<String>,
    },
    /// Create a secondary index
    CreateIndex {
        name: String,
        /// Comma-separated field paths, e.g. "type,created_at"
        fields: String,
        #[arg(long, value_enum, default_value = "json")]
        kind: IndexKindArg,
    },
    /// Drop a secondary index
    DropIndex { name: String },
    /// Rebuild every index from current winning revisions
    Reindex,
    /// Compact revision history, dropping non-leaf bodies beyond the revision limit
    Compact,
    /// Garbage-collect attachment blobs no longer referenced by any revision
    Gc,
    /// Pull changes from a remote peer
    Pull { remote_url: String },
    /// Push changes to a remote peer
    Push { remote_url: String },
    /// Pull then push against a remote peer
    Sync { remote_url: String },
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum IndexKindArg {
    Json,
    Text,
}

impl From<IndexKindArg> for IndexKind {
    fn from(value: IndexKindArg) -> Self {
        match value {
            IndexKindArg::Json => IndexKind::Json,
            IndexKindArg::Text => IndexKind::Text,
        }
    }
}

/// Parses a `--sort` flag like `"age,name:desc"` into `(field, descending)`
/// pairs, mirroring the CSV style `CreateIndex.fields` already uses.
fn parse_sort(spec: &str) -> Vec<(String, bool)> {
    spec.split(',')
        .map(|part| {
            let part = part.trim();
            match part.rsplit_once(':') {
                Some((field, "desc")) => (field.to_string(), true),
                Some((field, "asc")) => (field.to_string(), false),
                _ => (part.to_string(), false),
            }
        })
        .collect()
}

fn read_stdin_json() -> Result<serde_json::Value> {
    let mut buf = String::new();
    io::Read::read_to_string(&mut io::stdin(), &mut buf).context("reading JSON body from stdin")?;
    serde_json::from_str(&buf).context("parsing JSON body")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init) => {
            info!("initializing store at {}", cli.root.display());
            Datastore::open(StoreOptions::new(cli.root.clone()))?;
            println!("store initialized at {}", cli.root.display());
        }
        Some(Commands::Put { doc_id }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let body = read_stdin_json()?;
            let id = doc_id.map(DocId::new).transpose()?;
            let revision = store.put(id, body)?;
            println!("{} {}", revision.doc_id, revision.rev_id);
        }
        Some(Commands::Update { doc_id, rev }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let body = read_stdin_json()?;
            let doc_id = DocId::new(doc_id)?;
            let rev: RevId = rev.parse().context("parsing --rev")?;
            let revision = store.update(&doc_id, &rev, body)?;
            println!("{} {}", revision.doc_id, revision.rev_id);
        }
        Some(Commands::Get { doc_id, attachments }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let doc_id = DocId::new(doc_id)?;
            let doc = store.get(&doc_id, attachments)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Some(Commands::Delete { doc_id, rev }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let doc_id = DocId::new(doc_id)?;
            let rev: RevId = rev.parse().context("parsing rev")?;
            let tombstone = store.delete(&doc_id, &rev)?;
            println!("{} {}", tombstone.doc_id, tombstone.rev_id);
        }
        Some(Commands::Conflicts { doc_id }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let doc_id = DocId::new(doc_id)?;
            for leaf in store.conflicts(&doc_id)? {
                println!("{}", leaf.rev_id);
            }
        }
        Some(Commands::Resolve { doc_id }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let doc_id = DocId::new(doc_id)?;
            let body = read_stdin_json()?;
            let merged = store.resolve_conflict(&doc_id, body)?;
            println!("{} {}", merged.doc_id, merged.rev_id);
        }
        Some(Commands::Query { limit, sort }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let selector = read_stdin_json()?;
            let sort_fields = sort.map(|s| parse_sort(&s)).unwrap_or_default();
            let sort_refs: Vec<(&str, bool)> =
                sort_fields.iter().map(|(field, desc)| (field.as_str(), *desc)).collect();
            let page = store.query(&selector, &sort_refs, limit)?;
            for doc in page.docs {
                println!("{} {}", doc.doc_id, doc.rev_id);
            }
        }
        Some(Commands::CreateIndex { name, fields, kind }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let fields: Vec<String> = fields.split(',').map(|s| s.trim().to_string()).collect();
            store.create_index(&name, fields, kind.into())?;
            println!("index '{name}' created");
        }
        Some(Commands::DropIndex { name }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            store.drop_index(&name)?;
            println!("index '{name}' dropped");
        }
        Some(Commands::Reindex) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            store.reindex()?;
            println!("reindex complete");
        }
        Some(Commands::Compact) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            store.compact()?;
            println!("compaction complete");
        }
        Some(Commands::Gc) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let removed = store.gc_blobs()?;
            println!("removed {removed} unreferenced blobs");
        }
        Some(Commands::Pull { remote_url }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let summary = store.pull(ReplicatorOptions::new(remote_url), &CancellationToken::new())?;
            println!(
                "pulled {} docs, last_seq {} ({})",
                summary.docs_written, summary.last_seq, summary.completed_at
            );
        }
        Some(Commands::Push { remote_url }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let summary = store.push(ReplicatorOptions::new(remote_url), &CancellationToken::new())?;
            println!(
                "pushed {} docs, last_seq {} ({})",
                summary.docs_written, summary.last_seq, summary.completed_at
            );
        }
        Some(Commands::Sync { remote_url }) => {
            let store = Datastore::open(StoreOptions::new(cli.root))?;
            let (pulled, pushed) = store.sync(ReplicatorOptions::new(remote_url), &CancellationToken::new())?;
            println!(
                "pulled {} docs ({}), pushed {} docs ({})",
                pulled.docs_written, pulled.completed_at, pushed.docs_written, pushed.completed_at
            );
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}
