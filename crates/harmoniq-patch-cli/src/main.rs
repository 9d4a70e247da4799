use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use harmoniq_patch_db::{
    DataSource, PatchDb, PatchDbConfig, PatchPtr, RawSysexAdapter, SearchRequest, SourceType,
    Tag, TagType, TypedTags,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let settings = cli
        .settings
        .unwrap_or_else(PatchDbConfig::default_settings_dir);
    let db = PatchDb::open(PatchDbConfig::in_dir(&settings), Arc::new(RawSysexAdapter))
        .with_context(|| format!("failed to open patch database in {}", settings.display()))?;
    settle(&db)?;

    match cli.command {
        Commands::Sources => list_sources(&db),
        Commands::Add(source) => {
            db.add_data_source(source.to_source());
            settle(&db)
        }
        Commands::Remove(source) => {
            db.remove_data_source(source.to_source());
            settle(&db)
        }
        Commands::Refresh(source) => {
            db.refresh_data_source(source.to_source());
            settle(&db)
        }
        Commands::List(source) => list_patches(&db, &source.to_source()),
        Commands::Search(args) => search(&db, args),
        Commands::Tag(args) => tag(&db, args),
        Commands::Rename(args) => {
            let patch = find_patch(&db, &args.patch)?;
            if !db.rename_patch(&patch, args.name) {
                bail!("patch already has that name");
            }
            settle(&db)
        }
        Commands::Copy(args) => {
            let patch = find_patch(&db, &args.patch)?;
            let bank = DataSource::local_storage(args.bank);
            db.add_data_source(bank.clone());
            db.copy_patches_to(&bank, &[patch], args.at);
            settle(&db)
        }
        Commands::Export(args) => {
            let patches = db.patches(&args.source.to_source());
            if patches.is_empty() {
                bail!("{} has no patches", args.source.to_source());
            }
            db.export_patches(&args.output, &patches)
                .with_context(|| format!("failed to export to {}", args.output.display()))?;
            println!("Exported {} patches to {}", patches.len(), args.output.display());
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Patch catalog tools for Harmoniq Studio")]
struct Cli {
    /// Directory holding the patch index and local banks.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every known data source.
    Sources,
    /// Add a data source to the catalog.
    Add(SourceArgs),
    /// Remove a data source from the catalog.
    Remove(SourceArgs),
    /// Reload a data source from disk.
    Refresh(SourceArgs),
    /// List the patches of a data source.
    List(SourceArgs),
    /// Find patches by name, tags and source type.
    Search(SearchArgs),
    /// Add or remove tags of a patch.
    Tag(TagArgs),
    /// Give a patch a new display name.
    Rename(RenameArgs),
    /// Copy a patch into a local bank.
    Copy(CopyArgs),
    /// Write all patches of a data source into a single sysex file.
    Export(ExportArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    File,
    Folder,
    Bank,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(value_enum)]
    kind: SourceKind,
    /// Path of a file or folder, name of a local bank.
    name: String,
}

impl SourceArgs {
    fn to_source(&self) -> DataSource {
        match self.kind {
            SourceKind::File => DataSource::file(&self.name),
            SourceKind::Folder => DataSource::folder(&self.name),
            SourceKind::Bank => DataSource::local_storage(&self.name),
        }
    }
}

#[derive(Args)]
struct PatchArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Program number inside the data source.
    program: u32,
}

#[derive(Args)]
struct SearchArgs {
    /// Case-insensitive part of the patch name.
    #[arg(long, default_value = "")]
    name: String,
    /// Required tag, `Type=Value`.
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(TagType, Tag)>,
    /// Excluded tag, `Type=Value`.
    #[arg(long = "without", value_parser = parse_tag)]
    without: Vec<(TagType, Tag)>,
    #[arg(long, value_parser = parse_source_type)]
    source_type: Option<SourceType>,
}

#[derive(Args)]
struct TagArgs {
    #[command(flatten)]
    patch: PatchArgs,
    #[arg(long = "add", value_parser = parse_tag)]
    add: Vec<(TagType, Tag)>,
    #[arg(long = "remove", value_parser = parse_tag)]
    remove: Vec<(TagType, Tag)>,
}

#[derive(Args)]
struct RenameArgs {
    #[command(flatten)]
    patch: PatchArgs,
    name: String,
}

#[derive(Args)]
struct CopyArgs {
    #[command(flatten)]
    patch: PatchArgs,
    /// Local bank receiving the copy, created on demand.
    #[arg(long)]
    bank: String,
    /// Insert at this program instead of appending.
    #[arg(long)]
    at: Option<u32>,
}

#[derive(Args)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, short)]
    output: PathBuf,
}

fn parse_tag(value: &str) -> Result<(TagType, Tag), String> {
    let (ty, tag) = value
        .split_once('=')
        .ok_or_else(|| format!("expected Type=Value, got '{value}'"))?;
    let ty = TagType::parse(ty).ok_or_else(|| format!("unknown tag type '{ty}'"))?;
    if tag.is_empty() {
        return Err("tag must not be empty".to_string());
    }
    Ok((ty, tag.to_string()))
}

fn parse_source_type(value: &str) -> Result<SourceType, String> {
    match value.parse::<SourceType>() {
        Ok(SourceType::Invalid) | Err(_) => Err(format!("unknown source type '{value}'")),
        Ok(ty) => Ok(ty),
    }
}

/// Waits for queued work and reports errors it produced.
fn settle(db: &PatchDb) -> Result<()> {
    db.wait_for_loader()?;
    let dirty = db.ui_process();
    for error in &dirty.errors {
        eprintln!("error: {error}");
    }
    if !dirty.errors.is_empty() {
        bail!("{} operation(s) failed", dirty.errors.len());
    }
    Ok(())
}

fn find_patch(db: &PatchDb, args: &PatchArgs) -> Result<PatchPtr> {
    let source = args.source.to_source();
    db.patches(&source)
        .into_iter()
        .find(|patch| patch.program() == args.program)
        .ok_or_else(|| anyhow!("{source} has no patch at program {}", args.program))
}

fn describe(patch: &PatchPtr) -> String {
    let tags: Vec<String> = patch
        .tags()
        .iter()
        .flat_map(|(ty, tags)| {
            tags.added()
                .iter()
                .map(move |tag| format!("{ty}={tag}"))
                .collect::<Vec<_>>()
        })
        .collect();
    let edited = if patch.has_modifications() { "*" } else { " " };
    if tags.is_empty() {
        format!("{:>4}{edited} {}", patch.program(), patch.name())
    } else {
        format!("{:>4}{edited} {}  [{}]", patch.program(), patch.name(), tags.join(", "))
    }
}

fn list_sources(db: &PatchDb) -> Result<()> {
    for source in db.data_sources() {
        let count = db.patches(&source).len();
        println!("{source}  ({count} patches)");
    }
    Ok(())
}

fn list_patches(db: &PatchDb, source: &DataSource) -> Result<()> {
    if db.with_sources(|tree| tree.find(source).is_none()) {
        bail!("unknown data source {source}");
    }
    for patch in db.patches(source) {
        println!("{}", describe(&patch));
    }
    Ok(())
}

fn search(db: &PatchDb, args: SearchArgs) -> Result<()> {
    let mut tags = TypedTags::new();
    for (ty, tag) in args.tags {
        tags.add(ty, tag);
    }
    for (ty, tag) in args.without {
        tags.add_removed(ty, tag);
    }
    let request = SearchRequest {
        name: args.name,
        tags,
        source_type: args.source_type,
        ..SearchRequest::default()
    };
    let handle = db.search(request);
    settle(db)?;
    let search = db
        .get_search(handle)
        .ok_or_else(|| anyhow!("search was cancelled"))?;

    let mut results = search.results();
    results.sort_by_key(|patch| patch.name());
    for patch in &results {
        let source = db
            .data_source_of(patch)
            .map(|source| source.to_string())
            .unwrap_or_default();
        println!("{}  {source}", describe(patch));
    }
    println!("{} patches found", results.len());
    db.cancel_search(handle);
    Ok(())
}

fn tag(db: &PatchDb, args: TagArgs) -> Result<()> {
    let patch = find_patch(db, &args.patch)?;
    let mut diff = TypedTags::new();
    for (ty, tag) in args.add {
        db.add_tag(ty, tag.clone());
        diff.add(ty, tag);
    }
    for (ty, tag) in args.remove {
        diff.add_removed(ty, tag);
    }
    if !db.modify_tags(&[patch.clone()], &diff) {
        bail!("nothing to change");
    }
    settle(db)?;
    println!("{}", describe(&patch));
    Ok(())
}
