use handoff_core::{RunReport, Utf8Codec};
use handoff_wasm::{Binding, Bridge, BridgeConfig, BridgeError, BridgeState, Caller, HostContext, HostValue};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
handoff module runner

Usage:
  handoff <command> [options]

Commands:
  run <module> [--entry <name>] [--config <file>] [--json]
  check <module> [--config <file>]

Options:
  -h, --help     Show this help message
  --version      Show version information
";

const RUN_HELP: &str = "\
Usage:
  handoff run <module.wasm|module.wat> [--entry <name>] [--config <file>] [--json]

Options:
  --entry        Export to call (default: main)
  --config       Bridge config file (JSON)
  --json         Emit JSON report
  -h, --help     Show this help message
";

const CHECK_HELP: &str = "\
Usage:
  handoff check <module.wasm|module.wat> [--config <file>]

Options:
  --config       Bridge config file (JSON)
  -h, --help     Show this help message
";

const DEFAULT_ENTRY: &str = "main";
const SAMPLE_DATA: [u8; 3] = [43, 55, 67];

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run {
        path: String,
        entry: String,
        config: Option<String>,
        json: bool,
    },
    Check {
        path: String,
        config: Option<String>,
    },
}

fn main() {
    init_tracing();
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || matches!(args[0].as_str(), "-h" | "--help") {
        print!("{HELP}");
        return;
    }

    if args[0] == "--version" {
        println!("{} {}", handoff_core::TOOL_NAME, env!("CARGO_PKG_VERSION"));
        return;
    }

    if args[0] == "run" && contains_help_flag(&args[1..]) {
        print!("{RUN_HELP}");
        return;
    }
    if args[0] == "check" && contains_help_flag(&args[1..]) {
        print!("{CHECK_HELP}");
        return;
    }

    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            eprintln!("{HELP}");
            process::exit(2);
        }
    };

    if let Err(message) = execute(command) {
        eprintln!("error: {message}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn contains_help_flag(args: &[String]) -> bool {
    args.iter().any(|arg| matches!(arg.as_str(), "-h" | "--help"))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    match args[0].as_str() {
        "run" => parse_run(&args[1..]),
        "check" => parse_check(&args[1..]),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_run(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(args, true)?;
    let path = parsed
        .path
        .ok_or_else(|| "missing module path for run".to_string())?;
    Ok(Command::Run {
        path,
        entry: parsed.entry.unwrap_or_else(|| DEFAULT_ENTRY.to_string()),
        config: parsed.config,
        json: parsed.json,
    })
}

fn parse_check(args: &[String]) -> Result<Command, String> {
    let parsed = parse_path_and_flags(args, false)?;
    let path = parsed
        .path
        .ok_or_else(|| "missing module path for check".to_string())?;
    Ok(Command::Check {
        path,
        config: parsed.config,
    })
}

struct ParsedArgs {
    path: Option<String>,
    entry: Option<String>,
    config: Option<String>,
    json: bool,
}

fn parse_path_and_flags(args: &[String], allow_run_flags: bool) -> Result<ParsedArgs, String> {
    let mut path = None;
    let mut entry = None;
    let mut config = None;
    let mut json = false;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => {
                if !allow_run_flags {
                    return Err("unexpected --json".to_string());
                }
                json = true;
            }
            "--entry" => {
                if !allow_run_flags {
                    return Err("unexpected --entry".to_string());
                }
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --entry".to_string())?;
                entry = Some(value.to_string());
            }
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config = Some(value.to_string());
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option '{flag}'"));
            }
            value => {
                if path.is_some() {
                    return Err("multiple paths provided".to_string());
                }
                path = Some(value.to_string());
            }
        }
    }

    Ok(ParsedArgs {
        path,
        entry,
        config,
        json,
    })
}

fn execute(command: Command) -> Result<(), String> {
    match command {
        Command::Run {
            path,
            entry,
            config,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let image = load_module(&path)?;
            let report = run_report(&image, &entry, config);
            if json {
                println!("{}", report.to_json());
                return Ok(());
            }
            for line in &report.stdout {
                println!("{line}");
            }
            match report.error {
                Some(err) => Err(err.to_string()),
                None => Ok(()),
            }
        }
        Command::Check { path, config } => {
            let config = load_config(config.as_deref())?;
            let image = load_module(&path)?;
            let mut bridge = reference_bridge(config).map_err(|err| err.to_string())?;
            bridge.initialize(&image).map_err(|err| err.to_string())?;
            println!("ok: {path}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&str>) -> Result<BridgeConfig, String> {
    match path {
        Some(path) => BridgeConfig::load(Path::new(path)).map_err(|err| err.to_string()),
        None => Ok(BridgeConfig::default()),
    }
}

fn load_module(path: &str) -> Result<Vec<u8>, String> {
    let is_text = Path::new(path)
        .extension()
        .is_some_and(|ext| ext == "wat");
    if is_text {
        wat::parse_file(path).map_err(|err| format!("unable to parse '{path}': {err}"))
    } else {
        fs::read(path).map_err(|err| format!("unable to read '{path}': {err}"))
    }
}

/// Bridge with the reference host functions: `consoleLog(ptr, len)` and
/// `sampleDat() -> handle`.
fn reference_bridge(config: BridgeConfig) -> Result<Bridge<Vec<String>>, BridgeError> {
    let mut bridge = Bridge::new(config, Vec::new())?;
    bridge
        .expose(
            "consoleLog",
            |caller: Caller<'_, BridgeState<Vec<String>>>, ptr: u32, len: u32| -> anyhow::Result<()> {
                let mut context = HostContext::new(caller);
                let text = Binding::new(Utf8Codec).read_and_deserialize(&context, ptr, len)?;
                info!(target: "handoff::console", "{text}");
                context.data_mut().push(text);
                Ok(())
            },
        )?
        .wrap("sampleDat", &[], |_, _| Ok(HostValue::from(SAMPLE_DATA)))?;
    Ok(bridge)
}

fn run_report(image: &[u8], entry: &str, config: BridgeConfig) -> RunReport {
    let mut report = RunReport::new(entry);
    let mut bridge = match reference_bridge(config) {
        Ok(bridge) => bridge,
        Err(err) => {
            report.error = Some(err);
            return report;
        }
    };
    let outcome = bridge
        .initialize(image)
        .and_then(|()| bridge.call::<(), ()>(entry, ()));
    debug!(entry, ok = outcome.is_ok(), "run finished");
    report.ok = outcome.is_ok();
    report.error = outcome.err();
    report.stdout = std::mem::take(bridge.data_mut());
    report.live_handles = bridge.live_handles();
    report
}
