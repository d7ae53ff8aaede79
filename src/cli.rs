/// Operational entry points. The pipeline itself lives in the library; the
/// binary surface stays thin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Process one batch and exit.
    Run,
    /// Register bucket objects under a prefix into the files catalog.
    Scan { prefix: String },
    /// Keep running batches on the configured cron schedule.
    Serve,
    /// Apply pending migrations and exit.
    Migrate,
    Help,
}

pub fn parse_command(args: &[String]) -> Command {
    match args.get(1).map(|s| s.as_str()) {
        None | Some("run") => Command::Run,
        Some("scan") => Command::Scan {
            prefix: args.get(2).cloned().unwrap_or_default(),
        },
        Some("serve") => Command::Serve,
        Some("migrate") => Command::Migrate,
        _ => Command::Help,
    }
}

pub fn print_usage() {
    println!("pollinator-pipeline");
    println!();
    println!("USAGE:");
    println!("  pollinator-pipeline [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("  run            Process the next unprocessed batch (default)");
    println!("  scan [PREFIX]  Register bucket objects under PREFIX in the files catalog");
    println!("  serve          Run batches on the configured cron schedule");
    println!("  migrate        Apply pending database migrations and exit");
    println!("  help           Show this message");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        std::iter::once("pollinator-pipeline")
            .chain(parts.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_to_run() {
        assert_eq!(parse_command(&args(&[])), Command::Run);
        assert_eq!(parse_command(&args(&["run"])), Command::Run);
    }

    #[test]
    fn test_scan_takes_optional_prefix() {
        assert_eq!(
            parse_command(&args(&["scan", "plot-7/"])),
            Command::Scan {
                prefix: "plot-7/".to_string()
            }
        );
        assert_eq!(
            parse_command(&args(&["scan"])),
            Command::Scan {
                prefix: String::new()
            }
        );
    }

    #[test]
    fn test_unknown_command_prints_help() {
        assert_eq!(parse_command(&args(&["bogus"])), Command::Help);
        assert_eq!(parse_command(&args(&["--help"])), Command::Help);
    }
}
