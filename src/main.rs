use anyhow::{bail, Context};
use args::Args;
use getopts::Occur;
use ksm_preload::config::{self, MERGE_THRESHOLD_ENV};
use ksm_preload::KsmStats;
use num_format::{Locale, ToFormattedString};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command, ExitStatus};
use std::{env, ffi::OsString};

const PROGRAM_DESC: &str = "Run a program with kernel same-page merging enabled on its memory";
const PROGRAM_NAME: &str = "ksmp";
const PRELOAD_LIBRARY: &str = "libksmp.so";

fn main() -> Result<(), anyhow::Error> {
    let argv: Vec<String> = env::args().skip(1).collect();
    let (options, command) = split_command(&argv);

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.flag("h", "help", "Print this help and exit");
    args.flag(
        "s",
        "stats",
        "Print the kernel's KSM counters once the command exits",
    );
    args.flag("y", "yaml", "Print the counters as YAML");
    args.option(
        "t",
        "threshold",
        "Regions no larger than this many bytes are not merged",
        "BYTES",
        Occur::Optional,
        None,
    );
    args.option(
        "l",
        "lib",
        "Path to the preload library",
        "PATH",
        Occur::Optional,
        None,
    );

    args.parse(options)?;

    let help: bool = args.value_of("help")?;
    if help {
        eprintln!("{}", args.full_usage());
        eprintln!("\nUsage: {} [OPTIONS] -- COMMAND [ARGS...]", PROGRAM_NAME);
        return Ok(());
    }
    if command.is_empty() {
        bail!("no command given\n{}", args.short_usage());
    }

    let library = match args.optional_value_of::<String>("lib")? {
        Some(lib) => PathBuf::from(lib),
        None => default_library()?,
    };
    if !library.is_file() {
        bail!("preload library {} not found", library.display());
    }

    let mut child = Command::new(&command[0]);
    child.args(&command[1..]);
    child.env(
        "LD_PRELOAD",
        preload_list(&library, env::var_os("LD_PRELOAD")),
    );

    if let Some(threshold) = args.optional_value_of::<String>("threshold")? {
        child.env(MERGE_THRESHOLD_ENV.to_str()?, threshold_value(&threshold)?);
    }

    match KsmStats::read() {
        Ok(stats) if !stats.is_running() => {
            eprintln!("warning: KSM is not running, enable it with 'echo 1 > /sys/kernel/mm/ksm/run'")
        }
        Ok(_) => {}
        Err(e) => eprintln!("warning: {}", e),
    }

    let status = child
        .status()
        .with_context(|| format!("failed to run {}", command[0]))?;

    let stats: bool = args.value_of("stats")?;
    if stats {
        let yaml: bool = args.value_of("yaml")?;
        let snapshot = KsmStats::read()?;
        if yaml {
            eprintln!("{}", snapshot.to_yaml()?);
        } else {
            eprintln!("KSM counters:\n{}", snapshot);
            if let Some(saved) = snapshot.saved_bytes(config::page_size()) {
                eprintln!("saved: {}B", saved.to_formatted_string(&Locale::en));
            }
        }
    }

    process::exit(exit_code(status));
}

// Options before `--`, the command after it.
fn split_command(argv: &[String]) -> (&[String], &[String]) {
    match argv.iter().position(|a| a == "--") {
        Some(idx) => (&argv[..idx], &argv[idx + 1..]),
        None => (argv, &argv[argv.len()..]),
    }
}

// Checked here so a typo fails loudly instead of silently falling back to the default.
fn threshold_value(raw: &str) -> Result<String, anyhow::Error> {
    let bytes = config::parse_threshold(raw.as_bytes())
        .with_context(|| format!("invalid threshold '{}'", raw))?;
    Ok(bytes.to_string())
}

// Mirror the shell: a child killed by a signal exits with 128 + signal.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

// The library is expected next to the launcher unless told otherwise.
fn default_library() -> Result<PathBuf, anyhow::Error> {
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .context("cannot locate the directory of the ksmp executable")?;
    Ok(dir.join(PRELOAD_LIBRARY))
}

// Ours goes first so that other preloaded allocators are still found behind it.
fn preload_list(library: &Path, existing: Option<OsString>) -> OsString {
    let mut list = OsString::from(library.as_os_str());
    if let Some(existing) = existing {
        if !existing.is_empty() {
            list.push(":");
            list.push(existing);
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn command_follows_double_dash() {
        let argv = strings(&["-t", "4096", "--", "python", "--", "-c"]);
        let (options, command) = split_command(&argv);
        assert_eq!(options, &strings(&["-t", "4096"])[..]);
        assert_eq!(command, &strings(&["python", "--", "-c"])[..]);

        let argv = strings(&["--help"]);
        let (options, command) = split_command(&argv);
        assert_eq!(options, &argv[..]);
        assert!(command.is_empty());
    }

    #[test]
    fn library_is_preloaded_first() {
        let lib = Path::new("/opt/ksmp/libksmp.so");
        assert_eq!(preload_list(lib, None), OsString::from("/opt/ksmp/libksmp.so"));
        assert_eq!(
            preload_list(lib, Some(OsString::new())),
            OsString::from("/opt/ksmp/libksmp.so")
        );
        assert_eq!(
            preload_list(lib, Some(OsString::from("libjemalloc.so"))),
            OsString::from("/opt/ksmp/libksmp.so:libjemalloc.so")
        );
    }

    #[test]
    fn invalid_threshold_is_rejected() {
        assert_eq!(threshold_value("65536").unwrap(), "65536");
        for bad in ["-5", "abc", "", "12k"] {
            let err = threshold_value(bad).unwrap_err();
            assert!(err.to_string().contains("invalid threshold"), "{}", err);
        }
    }

    #[test]
    fn child_status_is_propagated() {
        let run = |script: &str| Command::new("sh").args(["-c", script]).status().unwrap();
        assert_eq!(exit_code(run("exit 0")), 0);
        assert_eq!(exit_code(run("exit 1")), 1);
        assert_eq!(exit_code(run("exit 42")), 42);
        assert_eq!(exit_code(run("kill -9 $$")), 128 + libc::SIGKILL);
    }
}
