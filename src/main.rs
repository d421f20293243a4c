mod cmake;
mod file_api;
mod io;
mod logging;
mod project;

#[cfg(test)]
mod test_utils;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use cmake::build_system::{AppTarget, parse_cmake_cache_txt};
use cmake::output_parser::{ConfigureProgress, OutputEvent};
use cmake::{
    BuildDirParameters, BuildSystem, BuildSystemEvent, BuildSystemSettings, CMakeConfig,
    CMakeTool, ProcessEvent, ProjectModel, ReparseFlags, ToolRegistry,
};
use logging::{LogConfig, init_logging};

/// CLI arguments for cmake-sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source directory containing the top-level CMakeLists.txt (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    source: Option<PathBuf>,

    /// Build directory (defaults to <source>/build)
    #[arg(long, value_name = "DIR")]
    build: Option<PathBuf>,

    /// CMAKE_BUILD_TYPE (defaults to the cached value, then Debug)
    #[arg(long, value_name = "TYPE")]
    build_type: Option<String>,

    /// Path to the cmake executable
    #[arg(long, value_name = "PATH", env = "CMAKE_PATH", default_value = "cmake")]
    cmake: PathBuf,

    /// Generator used for the initial configuration
    #[arg(long, short = 'G', value_name = "NAME")]
    generator: Option<String>,

    /// Cache entry for the initial configuration, e.g. -D CMAKE_CXX_STANDARD=20
    #[arg(long = "define", short = 'D', value_name = "KEY[:TYPE]=VALUE")]
    defines: Vec<String>,

    /// Run cmake even if the reply is up to date
    #[arg(long)]
    run_cmake: bool,

    /// Delete the cache and file-API replies before configuring
    #[arg(long)]
    clear_cache: bool,

    /// Build this target after a successful configuration
    #[arg(long, value_name = "NAME")]
    target: Option<String>,

    /// Print the project model as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Do not re-run cmake when CMake files changed
    #[arg(long)]
    no_auto_run: bool,

    /// Keep running and reparse when the reply changes
    #[arg(long)]
    watch: bool,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides CMAKE_SYNC_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct Summary<'a> {
    success: bool,
    build_directory: &'a std::path::Path,
    multi_config: bool,
    last_cmake_exit_code: i32,
    model: &'a ProjectModel,
    app_targets: Vec<AppTarget>,
    test_command: Option<Vec<String>>,
}

/// ctest command line running every listed test from any directory
fn test_command(build_system: &BuildSystem) -> Option<Vec<String>> {
    if build_system.model().tests.is_empty() {
        return None;
    }
    let test_dir = build_system.parameters().build_directory.display().to_string();
    let (ctest, arguments) =
        build_system.command_line_for_tests(&[], &["--test-dir".to_string(), test_dir])?;
    let mut command = vec![ctest.display().to_string()];
    command.extend(arguments);
    Some(command)
}

/// Build type from the command line, the existing cache, or Debug
fn resolve_build_type(requested: Option<String>, build: &std::path::Path) -> String {
    requested
        .or_else(|| {
            parse_cmake_cache_txt(&build.join("CMakeCache.txt"))
                .ok()
                .and_then(|cache| cache.value_of("CMAKE_BUILD_TYPE").map(str::to_string))
                .filter(|build_type| !build_type.is_empty())
        })
        .unwrap_or_else(|| "Debug".to_string())
}

/// Arguments passed when the build directory is configured for the first time
fn initial_arguments(build_type: &str, defines: &[String]) -> anyhow::Result<Vec<String>> {
    let mut arguments = vec![format!("-DCMAKE_BUILD_TYPE:STRING={build_type}")];
    arguments.extend(defines.iter().map(|define| format!("-D{define}")));

    let (_, unknown) = CMakeConfig::from_arguments(arguments.as_slice());
    if !unknown.is_empty() {
        bail!("Invalid cache entries: {}", unknown.join(", "));
    }
    Ok(arguments)
}

fn print_output(event: &ProcessEvent) {
    match event {
        ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) | ProcessEvent::Message(line) => {
            eprintln!("{line}");
        }
        ProcessEvent::Parsed(OutputEvent::Diagnostic(diagnostic)) => {
            debug!("Diagnostic: {:?}", diagnostic);
        }
        ProcessEvent::Parsed(OutputEvent::Progress(ConfigureProgress::BuildFilesWritten(path))) => {
            info!("Build files written to {}", path.display());
        }
        ProcessEvent::Parsed(OutputEvent::Progress(progress)) => {
            debug!("Progress: {:?}", progress);
        }
    }
}

fn print_summary(build_system: &BuildSystem, success: bool, json: bool) -> anyhow::Result<()> {
    let model = build_system.model();
    let parameters = build_system.parameters();
    if json {
        let summary = Summary {
            success,
            build_directory: &parameters.build_directory,
            multi_config: build_system.is_multi_config(),
            last_cmake_exit_code: build_system.last_cmake_exit_code(),
            model,
            app_targets: build_system.app_targets(),
            test_command: test_command(build_system),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Project: {}", model.display_name);
    println!(
        "Build directory: {} ({})",
        parameters.build_directory.display(),
        if build_system.is_multi_config() {
            "multi-config".to_string()
        } else {
            parameters.cmake_build_type.clone()
        }
    );
    println!("Targets: {}", build_system.build_target_titles().join(", "));
    for app in build_system.app_targets() {
        if let Some(path) = &app.target_file_path {
            println!("  {} -> {}", app.display_name, path.display());
        }
    }
    println!("Code model parts: {}", model.project_parts.len());
    println!("Tests: {}", model.tests.len());
    if let Some(command) = test_command(build_system) {
        println!("  run with: {}", shell_words::join(&command));
    }
    for warning in &model.warnings {
        println!("Warning: {warning}");
    }
    if let Some(error) = &model.error {
        println!("Error: {error}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    init_logging(log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    let source = match args.source {
        Some(source) => source,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let source = source
        .canonicalize()
        .with_context(|| format!("Source directory {} not found", source.display()))?;
    let build = args.build.unwrap_or_else(|| source.join("build"));

    let mut tool = CMakeTool::new("default", &args.cmake).with_auto_run(!args.no_auto_run);
    tool.probe()
        .await
        .with_context(|| format!("Failed to query {}", args.cmake.display()))?;
    info!("Using cmake {} at {}", tool.full_version(), tool.executable().display());

    let mut tools = ToolRegistry::new();
    tools.register(tool);
    let tool = tools
        .default_tool()
        .context("No CMake tool registered")?;

    let build_type = resolve_build_type(args.build_type, &build);
    let mut parameters = BuildDirParameters::new(&source, &build, Some(tool))
        .with_build_type(build_type.as_str())
        .with_initial_arguments(initial_arguments(&build_type, &args.defines)?)
        .with_environment(std::env::vars().collect());
    if let Some(generator) = args.generator {
        parameters = parameters.with_generator(generator);
    }

    let mut build_system = BuildSystem::new(BuildSystemSettings::default());
    let mut flags = ReparseFlags::URGENT;
    if args.run_cmake {
        flags |= ReparseFlags::FORCE_CMAKE_RUN;
    }
    build_system.set_parameters_and_request_parse(parameters, flags)?;
    if args.clear_cache {
        build_system.clear_cmake_cache()?;
    }

    let mut last_success = None;
    loop {
        let event = tokio::select! {
            event = build_system.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                build_system.stop_cmake_run();
                break;
            }
        };
        let Some(event) = event else {
            break;
        };

        match event {
            BuildSystemEvent::Output(output) => print_output(&output),
            BuildSystemEvent::ParsingStarted => info!("Parsing {}", source.display()),
            BuildSystemEvent::ConfigurationStarted => info!("Running CMake"),
            BuildSystemEvent::ConfigurationCleared => info!("CMake configuration cleared"),
            BuildSystemEvent::Warning(message) => warn!("{}", message),
            BuildSystemEvent::Error(message) => warn!("{}", message),
            BuildSystemEvent::Updated { success } => {
                last_success = Some(success);
                // Tests are listed after a successful update
                if !success {
                    print_summary(&build_system, success, args.json)?;
                    if !args.watch {
                        break;
                    }
                }
            }
            BuildSystemEvent::TestInformationUpdated => {
                print_summary(&build_system, last_success == Some(true), args.json)?;
                if !args.watch {
                    break;
                }
            }
        }
    }

    match last_success {
        Some(true) => {}
        Some(false) => bail!(
            "Failed to load project (cmake exit code {}): {}",
            build_system.last_cmake_exit_code(),
            build_system.model().error.clone().unwrap_or_default()
        ),
        None => bail!("No project model was produced"),
    }

    if let Some(target) = args.target {
        let built = build_system.build_cmake_target(&target).await?;
        for output in build_system.take_output() {
            print_output(&output);
        }
        if !built {
            bail!("Building target {target} failed");
        }
        info!("Built target {}", target);
    }

    Ok(())
}
