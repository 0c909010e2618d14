use std::{convert::TryFrom, path::PathBuf, process::exit};

use clap::{load_yaml, App, ArgMatches};
use nix::sys::signal::Signal;

fn main() {
    let yaml = load_yaml!("nablarun.yaml");
    let matches = App::from(yaml).get_matches();

    init_logging(&matches);

    let root = matches
        .value_of("root")
        .map(PathBuf::from)
        .unwrap_or_else(default_root);

    let self_exe = std::env::current_exe().unwrap_or_else(|err| {
        eprintln!("could not resolve current executable: {}", err);
        exit(1);
    });

    let runtime = libnablarun::runtime(root, self_exe).unwrap_or_else(|err| {
        eprintln!("{}", err);
        exit(1);
    });

    let result = if let Some(args) = matches.subcommand_matches("state") {
        state(&runtime, args)
    } else if let Some(args) = matches.subcommand_matches("create") {
        create(&runtime, args)
    } else if let Some(args) = matches.subcommand_matches("start") {
        start(&runtime, args)
    } else if let Some(args) = matches.subcommand_matches("kill") {
        kill(&runtime, args)
    } else if let Some(args) = matches.subcommand_matches("delete") {
        delete(&runtime, args)
    } else if matches.subcommand_matches("init").is_some() {
        run_init()
    } else {
        eprintln!("no subcommand given, see --help");
        exit(1);
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        exit(1);
    }
}

type Runtime = libnablarun::Runtime<store::DirStore>;
type CliResult = Result<(), Box<dyn std::error::Error>>;

fn state(runtime: &Runtime, args: &ArgMatches) -> CliResult {
    let id = args.value_of("ID").unwrap();
    let state = runtime.state(id)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn create(runtime: &Runtime, args: &ArgMatches) -> CliResult {
    let id = args.value_of("ID").unwrap();
    let bundle_path = args.value_of("bundle").unwrap();
    let bundle = bundle::Bundle::load(bundle_path)?;

    runtime.create(id, &bundle)?;
    tracing::info!(%id, "created container");
    Ok(())
}

fn start(runtime: &Runtime, args: &ArgMatches) -> CliResult {
    let id = args.value_of("ID").unwrap();
    runtime.start(id)?;
    tracing::info!(%id, "started container");
    Ok(())
}

fn kill(runtime: &Runtime, args: &ArgMatches) -> CliResult {
    let id = args.value_of("ID").unwrap();
    let signal = parse_signal(args.value_of("SIGNAL").unwrap())?;
    let force = args.is_present("force");

    runtime.kill(id, signal, force)?;
    Ok(())
}

fn delete(runtime: &Runtime, args: &ArgMatches) -> CliResult {
    let id = args.value_of("ID").unwrap();
    let force = args.is_present("force");

    runtime.delete(id, force)?;
    Ok(())
}

/// `nablarun init` is never invoked by a human; the supervisor
/// re-execs itself into this subcommand with its config waiting on
/// the init pipe. Success never returns -- the exec handler replaces
/// this process with the monitor.
fn run_init() -> CliResult {
    let handlers = libnablarun::handlers();
    libnablarun::init::run(&handlers)?;
    unreachable!("init::run only returns on error, mapped to Err above")
}

fn parse_signal(raw: &str) -> Result<Signal, Box<dyn std::error::Error>> {
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|err| err.to_string().into());
    }

    let name = raw.trim_start_matches("SIG").to_uppercase();
    match name.as_str() {
        "HUP" => Ok(Signal::SIGHUP),
        "INT" => Ok(Signal::SIGINT),
        "QUIT" => Ok(Signal::SIGQUIT),
        "KILL" => Ok(Signal::SIGKILL),
        "TERM" => Ok(Signal::SIGTERM),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "CONT" => Ok(Signal::SIGCONT),
        "STOP" => Ok(Signal::SIGSTOP),
        _ => Err(format!("unrecognized signal {:?}", raw).into()),
    }
}

/// `--root`, falling back to `$XDG_STATE_HOME/nablarun`, then
/// `$HOME/.nablarun` -- the only configuration this runtime has
/// besides the bundle itself.
fn default_root() -> PathBuf {
    if let Some(xdg_state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(xdg_state).join("nablarun");
    }

    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".nablarun")
}

fn init_logging(matches: &ArgMatches) {
    let level = if matches.is_present("debug") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let json = matches.value_of("log-format") == Some("json");
    let log_file = matches.value_of("log").and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| eprintln!("could not open log file {:?}: {}", path, err))
            .ok()
    });

    let result = match (json, log_file) {
        (true, Some(file)) => tracing_subscriber::fmt()
            .with_max_level(level)
            .json()
            .with_writer(move || file.try_clone().expect("cloning log file handle"))
            .try_init(),
        (true, None) => tracing_subscriber::fmt().with_max_level(level).json().try_init(),
        (false, Some(file)) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(move || file.try_clone().expect("cloning log file handle"))
            .try_init(),
        (false, None) => tracing_subscriber::fmt().with_max_level(level).try_init(),
    };

    if let Err(err) = result {
        eprintln!("could not install tracing subscriber: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_accepts_names_and_numbers() {
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("NOTASIGNAL").is_err());
    }

    #[test]
    fn test_default_root_prefers_xdg_state_home() {
        std::env::set_var("XDG_STATE_HOME", "/tmp/xdg-state-test");
        assert_eq!(default_root(), PathBuf::from("/tmp/xdg-state-test/nablarun"));
        std::env::remove_var("XDG_STATE_HOME");
    }
}
