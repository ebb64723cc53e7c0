use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

use cmake_server_reader::config::DEFAULT_GENERATOR;
use cmake_server_reader::logging::{LogConfig, init_logging};
use cmake_server_reader::{
    CmakeServerLauncher, ConfigItem, KnownFile, ProjectTree, ReaderError, ReaderParameters,
    ServerModeReader, resolve_cmake_executable,
};

/// CLI arguments for the CMake server-mode reader
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Top-level source directory containing CMakeLists.txt
    #[arg(long, value_name = "DIR")]
    source: PathBuf,

    /// Build directory (created if missing)
    #[arg(long, value_name = "DIR")]
    build: PathBuf,

    /// CMake generator
    #[arg(long, value_name = "NAME", default_value = DEFAULT_GENERATOR)]
    generator: String,

    /// Path to cmake executable (overrides CMAKE_PATH env var)
    #[arg(long, value_name = "PATH")]
    cmake: Option<String>,

    /// Cache override in the form KEY[:TYPE]=VALUE
    #[arg(short = 'D', value_name = "KEY[:TYPE]=VALUE")]
    define: Vec<String>,

    /// Pass cache arguments even when the build directory already has a cache
    #[arg(long)]
    force: bool,

    /// Print the project tree instead of the target list
    #[arg(long)]
    tree: bool,

    /// Print the user-editable cache entries instead of the target list
    #[arg(long, conflicts_with = "tree")]
    cache: bool,

    /// Write compile_commands.json records to FILE
    #[arg(long, value_name = "FILE")]
    compile_commands: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CMAKE_SERVER_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Every regular file under `source`, skipping hidden entries and `build`
fn collect_known_files(source: &Path, build: &Path) -> Vec<KnownFile> {
    let walker = WalkDir::new(source)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry) && entry.path() != build);

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to access directory entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(KnownFile::new(entry.into_path()));
        }
    }
    files
}

/// The server wants absolute directories in the handshake
fn build_parameters(args: &Args) -> Result<ReaderParameters, ReaderError> {
    let source = std::path::absolute(&args.source)?;
    let build = std::path::absolute(&args.build)?;
    let mut builder = ReaderParameters::builder(source, build)
        .cmake_executable(resolve_cmake_executable(args.cmake.clone()))
        .generator(args.generator.clone());
    for define in &args.define {
        builder = builder.config_item(ConfigItem::parse(define)?);
    }
    Ok(builder.build())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let parameters = build_parameters(&args)?;
    info!(
        "Reading {} into {} with {}",
        parameters.source_directory.display(),
        parameters.build_directory.display(),
        parameters.cmake_executable
    );

    let mut reader = ServerModeReader::new(CmakeServerLauncher::new());
    reader.set_parameters(parameters.clone());

    let outcome = async {
        reader.parse(args.force).await?;
        reader.wait_for_completion().await
    }
    .await;
    if let Err(e) = outcome {
        reader.stop().await;
        return Err(e.into());
    }

    for diagnostic in reader.diagnostics() {
        warn!("{}", diagnostic);
    }

    let targets = reader.build_targets();
    info!(
        "Read {} targets, {} of them libraries",
        targets.len(),
        targets.iter().filter(|t| t.target_type.is_library()).count()
    );

    if args.tree {
        let files = collect_known_files(&parameters.source_directory, &parameters.build_directory);
        let mut tree = ProjectTree::new();
        if let Some(report) = reader.generate_project_tree(&mut tree, &files) {
            info!(
                "Project tree: {} nodes, {} files, {} added",
                tree.len(),
                tree.files_under(tree.root()).len(),
                report.added.len()
            );
        }
        print!("{}", tree.render());
    } else if args.cache {
        let entries: Vec<_> = reader
            .snapshot()
            .map(|snapshot| snapshot.cache.user_entries().cloned().collect())
            .unwrap_or_default();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&targets)?);
    }

    if let Some(path) = &args.compile_commands
        && let Some(code_model) = reader.update_code_model()
    {
        let entries = code_model.to_compile_commands()?;
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        info!("Wrote {} compile commands to {}", entries.len(), path.display());
    }

    reader.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    run(args).await
}
