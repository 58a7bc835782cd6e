use std::path::PathBuf;
// For the time being, I want to keep this as stupidly simple as possible.
// If the command surface gets out of hand later, I can bring in clap or
// whatever.

#[derive(Debug, PartialEq)]
pub enum Command {
    /// Run the tool server (the default).
    Serve,
    /// Run pending database migrations and exit.
    Migrate,
    /// Print store/migration/worker status and exit.
    Status,
    /// Run the connector-sync maintenance pipeline and exit.
    Sync,
    /// Check the store and the lock primitives and exit.
    Doctor,
    MemoryPut {
        slot: String,
        content: String,
        ttl_days: Option<i64>,
    },
    MemoryGet {
        slot: String,
    },
    MemoryPrune,
}

#[derive(Debug)]
pub struct CliOptions {
    /// The --config option lets you specify the path of the config file to
    /// use. It's optional; if omitted, we'll use hoard.toml in the current
    /// working directory.
    pub config: Option<PathBuf>,
    pub command: Command,
}

const USAGE: &str = "\
usage: hoard [--config <path>] <command>

commands:
  serve                                run the tool server (default)
  migrate                              run pending database migrations
  status                               show store and worker status
  sync                                 run the sync maintenance pipeline
  doctor                               check the store and lock primitives
  memory put <slot> <content> [ttl]    write a memory (ttl in days)
  memory get <slot>                    print a memory
  memory prune                         expire TTL'd memories
";

pub fn cli_options() -> Result<CliOptions, String> {
    parse(std::env::args().skip(1).collect())
}

fn parse(mut args: Vec<String>) -> Result<CliOptions, String> {
    // Pull out --config wherever it appears, then treat the rest as
    // positional words.
    let mut config = None;
    if let Some(idx) = args.iter().position(|a| a == "--config") {
        if idx + 1 >= args.len() {
            return Err(format!("--config needs a path\n\n{USAGE}"));
        }
        args.remove(idx);
        config = Some(PathBuf::from(args.remove(idx)));
    }

    let words: Vec<&str> = args.iter().map(|a| a.as_str()).collect();
    let command = match words.as_slice() {
        [] | ["serve"] => Command::Serve,
        ["migrate"] => Command::Migrate,
        ["status"] => Command::Status,
        ["sync"] => Command::Sync,
        ["doctor"] => Command::Doctor,
        ["memory", "put", slot, content] => Command::MemoryPut {
            slot: slot.to_string(),
            content: content.to_string(),
            ttl_days: None,
        },
        ["memory", "put", slot, content, ttl] => Command::MemoryPut {
            slot: slot.to_string(),
            content: content.to_string(),
            ttl_days: Some(
                ttl.parse()
                    .map_err(|_| format!("ttl must be a whole number of days\n\n{USAGE}"))?,
            ),
        },
        ["memory", "get", slot] => Command::MemoryGet {
            slot: slot.to_string(),
        },
        ["memory", "prune"] => Command::MemoryPrune,
        _ => return Err(USAGE.to_string()),
    };
    Ok(CliOptions { config, command })
}
