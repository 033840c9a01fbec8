use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Cell, Table as ComfyTable};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use txreplay::client::{CallKind, Fault};
use txreplay::{
    BatchUnit, Connection, DriverConfig, ExecutionContext, LogicalTransaction, MemoryClient,
    QueryResult, Statement, TransactionOptions, Value, WritePreference,
};

/// Interactive shell over an in-memory database, for watching the driver
/// route, retry and replay statements.
#[derive(Parser, Debug)]
#[command(name = "txreplay-shell")]
#[command(about = "txreplay interactive shell (in-memory backend)", long_about = None)]
struct Args {
    /// Driver config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write preference: never_mutate, mutate_only_implicit, always_mutate
    #[arg(short = 'w', long)]
    write_preference: Option<WritePreference>,

    /// File with DDL to run at startup, statements separated by ';'
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Session {
    conn: Connection<MemoryClient>,
    tx: Option<LogicalTransaction<MemoryClient>>,
    batch: Option<BatchUnit>,
    binds: Vec<Value>,
}

impl Session {
    fn context(&self) -> ExecutionContext<'_, MemoryClient> {
        match &self.tx {
            Some(tx) => ExecutionContext::Transaction(tx),
            None => self.conn.implicit(),
        }
    }

    fn prompt(&self) -> &'static str {
        match (&self.tx, &self.batch) {
            (_, Some(_)) => "txreplay(batch)> ",
            (Some(_), None) => "txreplay(tx)> ",
            (None, None) => "txreplay> ",
        }
    }

    fn statement(&mut self, sql: &str) -> Statement {
        Statement::with_positional(sql, std::mem::take(&mut self.binds))
    }

    fn run_sql(&mut self, sql: &str) {
        let stmt = self.statement(sql);
        if let Some(batch) = &mut self.batch {
            self.conn.add_to_batch(batch, stmt);
            println!("queued ({} in batch)", batch.len());
            return;
        }
        match self.conn.route_and_execute(&stmt, self.context()) {
            Ok(result) => print!("{}", format_result(result)),
            Err(err) => println!("ERROR: {err}"),
        }
    }

    fn meta(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();
        match command {
            "\\q" | "\\quit" => return false,
            "\\?" | "\\h" | "\\help" => print_help(),
            "\\begin" => {
                if self.tx.is_some() {
                    println!("ERROR: transaction already open");
                } else {
                    let mut options = TransactionOptions::explicit();
                    if rest.first().is_some_and(|arg| arg.eq_ignore_ascii_case("ro")) {
                        options = options.read_only();
                    }
                    self.tx = Some(self.conn.begin_transaction(options));
                    println!("BEGIN");
                }
            }
            "\\commit" => match self.tx.take() {
                Some(tx) => match tx.commit() {
                    Ok(stats) => println!(
                        "COMMIT ({} attempts, {} retries, {} mutations, {:?} backoff)",
                        stats.attempts, stats.retries, stats.mutations, stats.total_backoff
                    ),
                    Err(err) => println!("ERROR: {err}"),
                },
                None => println!("ERROR: no open transaction"),
            },
            "\\rollback" => match self.tx.take() {
                Some(tx) => match tx.rollback() {
                    Ok(()) => println!("ROLLBACK"),
                    Err(err) => println!("ERROR: {err}"),
                },
                None => println!("ERROR: no open transaction"),
            },
            "\\batch" => {
                self.batch = Some(self.conn.new_batch());
                println!("batch started, \\run to execute");
            }
            "\\run" => match self.batch.take() {
                Some(batch) => match self.conn.execute_batch(batch, self.context()) {
                    Ok(counts) => println!("BATCH {counts:?}"),
                    Err(err) => println!("ERROR: {err}"),
                },
                None => println!("ERROR: no batch started"),
            },
            "\\bind" => {
                let json = rest.join(" ");
                match serde_json::from_str::<serde_json::Value>(&json) {
                    Ok(serde_json::Value::Array(items)) => {
                        self.binds = items.iter().map(Value::from_json).collect();
                        println!("{} parameters bound for the next statement", self.binds.len());
                    }
                    _ => println!("ERROR: \\bind expects a JSON array, e.g. \\bind [1, \"a\"]"),
                }
            }
            "\\abort" => match rest.first().and_then(|name| parse_call(name)) {
                Some(call) => {
                    let skip = rest.get(1).and_then(|n| n.parse().ok()).unwrap_or(0);
                    self.conn.client().inject(Fault::abort(call).after(skip));
                    println!("abort armed on {call:?} after {skip} calls");
                }
                None => println!(
                    "ERROR: usage \\abort begin|execute|batch|mutation|commit [skip]"
                ),
            },
            "\\tables" => {
                for name in self.conn.client().table_names() {
                    println!("{name}");
                }
            }
            "\\calls" => {
                for call in self.conn.client().calls() {
                    println!("{call:?}");
                }
                self.conn.client().clear_calls();
            }
            "\\status" => match &self.tx {
                Some(tx) => match (tx.status(), tx.replay_len()) {
                    (Ok(status), Ok(len)) => println!("{status:?}, {len} replay entries"),
                    (Err(err), _) | (_, Err(err)) => println!("ERROR: {err}"),
                },
                None => println!("no open transaction ({:?})", self.conn.config().write_preference),
            },
            _ => println!("Unknown meta-command: {command}. Use \\? for help."),
        }
        true
    }
}

fn parse_call(name: &str) -> Option<CallKind> {
    match name.to_ascii_lowercase().as_str() {
        "begin" => Some(CallKind::Begin),
        "execute" => Some(CallKind::Execute),
        "batch" => Some(CallKind::ExecuteBatch),
        "mutation" => Some(CallKind::BufferMutation),
        "commit" => Some(CallKind::Commit),
        "read" => Some(CallKind::SingleUse),
        _ => None,
    }
}

fn format_result(result: QueryResult) -> String {
    match result {
        QueryResult::Success(msg) => format!("{msg}\n"),
        QueryResult::Affected(n) => format!("{n} rows affected\n"),
        QueryResult::Rows(rows, columns) => {
            if rows.is_empty() {
                return "(0 rows)\n".to_string();
            }

            let mut table = ComfyTable::new();
            table.load_preset(UTF8_FULL);
            table.set_header(columns.iter().map(Cell::new));
            let count = rows.len();
            for row in rows {
                table.add_row(row.iter().map(Cell::new));
            }
            format!("{table}\n({count} rows)\n")
        }
    }
}

fn print_help() {
    println!("Meta-commands:");
    println!("  \\begin [ro]         - Start an explicit transaction");
    println!("  \\commit, \\rollback  - End it");
    println!("  \\batch, \\run        - Queue DML, then execute it as one batch");
    println!("  \\bind <json array>  - Bind $1..$n for the next statement");
    println!("  \\abort <call> [n]   - Abort the next call of a kind, after n");
    println!("  \\tables, \\calls     - Show tables / client calls since last \\calls");
    println!("  \\status             - Transaction status");
    println!("  \\q                  - Quit");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = DriverConfig::load(args.config.as_deref())?;
    if let Some(preference) = args.write_preference {
        config = config.with_write_preference(preference);
    }

    let client = MemoryClient::new();
    let conn = Connection::new(client, config);
    if let Some(path) = &args.schema {
        let ddl = std::fs::read_to_string(path)?;
        for sql in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            conn.execute_ddl(sql)?;
        }
        println!("Loaded schema from: {}", path.display());
    }

    println!("txreplay shell v{} ({:?})", env!("CARGO_PKG_VERSION"), conn.config().write_preference);
    println!("Type \\? for help, \\q to quit.\n");

    let mut session = Session {
        conn,
        tx: None,
        batch: None,
        binds: Vec::new(),
    };

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir().map(|mut p| {
        p.push(".txreplay_history");
        p
    });
    if let Some(ref path) = history_file {
        let _ = rl.load_history(path);
    }

    loop {
        match rl.readline(session.prompt()) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if line.starts_with('\\') {
                    if !session.meta(line) {
                        break;
                    }
                } else {
                    session.run_sql(line.trim_end_matches(';'));
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err:?}");
                return Err(err.into());
            }
        }
    }

    if let Some(tx) = session.tx.take() {
        println!("rolling back open transaction");
        let _ = tx.rollback();
    }
    if let Some(ref path) = history_file {
        let _ = rl.save_history(path);
    }
    Ok(())
}
