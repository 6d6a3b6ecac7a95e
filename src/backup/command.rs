// Backup Tool Commands
// Argument-array invocations of the native dump/restore tools

use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::BackupError;
use crate::db::drivers::mongo::connection_uri;
use crate::db::traits::{ConnectionConfig, DatabaseType};

/// Appended to PATH so Homebrew and Postgres.app installs are found
const EXTRA_TOOL_DIRS: [&str; 3] = [
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/Applications/Postgres.app/Contents/Versions/latest/bin",
];

pub const SCHEMA_RESET: &str = "DROP SCHEMA public CASCADE; CREATE SCHEMA public;";

/// One tool run with optional stdin/stdout file redirection
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
}

impl ToolCommand {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Shell-equivalent rendering, for logs only
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, single_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| display_arg(a)));
        if let Some(path) = &self.stdin {
            parts.push(format!("< {}", shell_quote(&path.to_string_lossy())));
        }
        if let Some(path) = &self.stdout {
            parts.push(format!("> {}", shell_quote(&path.to_string_lossy())));
        }
        parts.join(" ")
    }
}

/// Commands run in order; a failing step stops the plan
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPlan {
    pub steps: Vec<ToolCommand>,
}

impl ToolPlan {
    fn single(step: ToolCommand) -> Self {
        Self { steps: vec![step] }
    }

    pub fn display(&self) -> String {
        self.steps
            .iter()
            .map(ToolCommand::display)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote `value` for display in a POSIX shell command line. Plain words pass
/// through, text without shell-active characters gets double quotes, anything
/// else single quotes.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        return value.to_string();
    }
    if !value.contains(['"', '$', '`', '\\', '!']) {
        return format!("\"{}\"", value);
    }
    single_quote(value)
}

fn display_arg(arg: &str) -> String {
    match arg.strip_prefix("--uri=") {
        Some(uri) if !uri.contains(['"', '$', '`', '\\', '!']) => format!("--uri=\"{}\"", uri),
        Some(uri) => format!("--uri={}", single_quote(uri)),
        None => shell_quote(arg),
    }
}

fn redaction_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"PGPASSWORD='(?:[^']|'\\'')*'", "PGPASSWORD='****'"),
            (r"PGPASSWORD=[^'\s]\S*", "PGPASSWORD=****"),
            (r#""-p[^"]*""#, "\"-p****\""),
            (r"'-p(?:[^']|'\\'')*'", "'-p****'"),
            (r"(^|\s)-p[^\s']\S*", "${1}-p****"),
            (r#""--password=[^"]*""#, "\"--password=****\""),
            (r"--password=('[^']*'|\S+)", "--password=****"),
            (r"(mongodb(?:\+srv)?://[^:/@\s]+):[^@\s]*@", "${1}:****@"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    })
}

/// Replace credentials in a command line or tool output with `****`
pub fn redact(text: &str) -> String {
    redaction_rules()
        .iter()
        .fold(text.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// Connection fields a tool needs, with engine defaults filled in
struct Target<'a> {
    host: &'a str,
    port: String,
    user: &'a str,
    password: Option<&'a str>,
}

impl<'a> Target<'a> {
    fn from_config(config: &'a ConnectionConfig, default_user: &'a str) -> Self {
        Self {
            host: config.host.as_deref().unwrap_or("localhost"),
            port: config.port_or_default().to_string(),
            user: config.username.as_deref().filter(|u| !u.is_empty()).unwrap_or(default_user),
            password: config.password.as_deref().filter(|p| !p.is_empty()),
        }
    }

    fn pg(&self, program: &str) -> ToolCommand {
        let cmd = ToolCommand::new(program);
        let cmd = match self.password {
            Some(password) => cmd.env("PGPASSWORD", password),
            None => cmd,
        };
        cmd.args(["-h", self.host, "-p", &self.port, "-U", self.user])
    }

    fn mysql(&self, program: &str) -> ToolCommand {
        let cmd = ToolCommand::new(program).args(["-h", self.host, "-P", &self.port, "-u", self.user]);
        match self.password {
            Some(password) => cmd.arg(format!("-p{}", password)),
            None => cmd,
        }
    }
}

/// Dump flags shared by the engines that support partial dumps
#[derive(Debug, Clone, Default)]
pub struct DumpScope<'a> {
    pub data_only: bool,
    pub schema_only: bool,
    pub tables: &'a [String],
}

/// Build the dump plan writing to `file`
pub fn backup_plan(
    config: &ConnectionConfig,
    database: &str,
    scope: &DumpScope<'_>,
    file: &Path,
) -> Result<ToolPlan, BackupError> {
    let plan = match config.engine {
        DatabaseType::Postgresql => {
            let mut cmd = Target::from_config(config, "postgres").pg("pg_dump");
            if scope.data_only {
                cmd = cmd.arg("--data-only");
            } else if scope.schema_only {
                cmd = cmd.arg("--schema-only");
            }
            if !scope.data_only {
                cmd = cmd.args(["--clean", "--if-exists"]);
            }
            for table in scope.tables {
                cmd = cmd.args(["-t", table.as_str()]);
            }
            let mut cmd = cmd.args(["--no-owner", "--no-acl", database]);
            cmd.stdout = Some(file.to_path_buf());
            ToolPlan::single(cmd)
        }
        DatabaseType::Mysql => {
            let mut cmd = Target::from_config(config, "root").mysql("mysqldump");
            if scope.data_only {
                cmd = cmd.arg("--no-create-info");
            } else if scope.schema_only {
                cmd = cmd.arg("--no-data");
            }
            let mut cmd = cmd.arg(database).args(scope.tables.iter().cloned());
            cmd.stdout = Some(file.to_path_buf());
            ToolPlan::single(cmd)
        }
        DatabaseType::Mongodb => ToolPlan::single(
            ToolCommand::new("mongodump")
                .arg(format!("--uri={}", connection_uri(config)))
                .arg(format!("--db={}", database))
                .arg(format!("--archive={}", file.to_string_lossy())),
        ),
        DatabaseType::Sqlite => {
            let path = config.file_path.as_deref().ok_or(BackupError::MissingDatabase)?;
            let command = if scope.schema_only {
                ".schema".to_string()
            } else if scope.tables.is_empty() {
                ".dump".to_string()
            } else {
                format!(".dump {}", scope.tables.join(" "))
            };
            let mut cmd = ToolCommand::new("sqlite3").arg(path).arg(command);
            cmd.stdout = Some(file.to_path_buf());
            ToolPlan::single(cmd)
        }
        DatabaseType::Mssql => {
            return Err(BackupError::Unsupported {
                operation: "Backup",
                engine: config.engine,
            })
        }
    };
    Ok(plan)
}

/// Build the restore plan replaying `file`. Postgres drops and recreates the
/// `public` schema first unless the dump holds data only.
pub fn restore_plan(
    config: &ConnectionConfig,
    database: &str,
    data_only: bool,
    file: &Path,
) -> Result<ToolPlan, BackupError> {
    let mut steps = Vec::new();
    match config.engine {
        DatabaseType::Postgresql => {
            let target = Target::from_config(config, "postgres");
            if !data_only {
                steps.push(target.pg("psql").args(["-d", database, "-c", SCHEMA_RESET]));
            }
            let mut replay = target.pg("psql").args(["-d", database]);
            replay.stdin = Some(file.to_path_buf());
            steps.push(replay);
        }
        DatabaseType::Mysql => {
            let mut cmd = Target::from_config(config, "root").mysql("mysql").arg(database);
            cmd.stdin = Some(file.to_path_buf());
            steps.push(cmd);
        }
        DatabaseType::Mongodb => steps.push(
            ToolCommand::new("mongorestore")
                .arg(format!("--uri={}", connection_uri(config)))
                .arg(format!("--db={}", database))
                .arg(format!("--archive={}", file.to_string_lossy()))
                .arg("--drop"),
        ),
        DatabaseType::Sqlite => {
            let path = config.file_path.as_deref().ok_or(BackupError::MissingDatabase)?;
            let mut cmd = ToolCommand::new("sqlite3").arg(path);
            cmd.stdin = Some(file.to_path_buf());
            steps.push(cmd);
        }
        DatabaseType::Mssql => {
            return Err(BackupError::Unsupported {
                operation: "Restore",
                engine: config.engine,
            })
        }
    }
    Ok(ToolPlan { steps })
}

/// `extra` dirs first, then the inherited PATH, then the well-known tool dirs
pub fn tool_search_path(extra: &[PathBuf]) -> Option<OsString> {
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = extra.to_vec();
    dirs.extend(std::env::split_paths(&inherited));
    for dir in EXTRA_TOOL_DIRS {
        let dir = PathBuf::from(dir);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    std::env::join_paths(dirs).ok()
}

/// Outcome of one finished step
#[derive(Debug, Default)]
pub struct StepOutput {
    pub success: bool,
    pub status: Option<i32>,
    pub stderr: Vec<String>,
}

/// Spawn `cmd`, handing each stderr line to `on_stderr` as it arrives
pub async fn run_step(
    cmd: &ToolCommand,
    search_path: Option<&OsString>,
    mut on_stderr: impl FnMut(&str),
) -> Result<StepOutput, BackupError> {
    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args).kill_on_drop(true);
    for (key, value) in &cmd.env {
        command.env(key, value);
    }
    if let Some(path) = search_path {
        command.env("PATH", path);
    }

    command.stdin(match &cmd.stdin {
        Some(path) => Stdio::from(std::fs::File::open(path)?),
        None => Stdio::null(),
    });
    command.stdout(match &cmd.stdout {
        Some(path) => Stdio::from(std::fs::File::create(path)?),
        None => Stdio::null(),
    });
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackupError::Tool(format!("{} not found on PATH", cmd.program))
        } else {
            BackupError::Io(e)
        }
    })?;

    let mut output = StepOutput::default();
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            on_stderr(&line);
            output.stderr.push(line);
        }
    }

    let status = child.wait().await?;
    output.success = status.success();
    output.status = status.code();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg_config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new(DatabaseType::Postgresql);
        config.host = Some("db.local".to_string());
        config.port = Some(5433);
        config.username = Some("admin".to_string());
        config.password = Some("s3cret".to_string());
        config.database = Some("app".to_string());
        config
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("app"), "app");
        assert_eq!(shell_quote("/tmp/a b.sql"), "\"/tmp/a b.sql\"");
        assert_eq!(shell_quote("it's"), "\"it's\"");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
        assert_eq!(shell_quote("a'$b"), "'a'\\''$b'");
        assert_eq!(shell_quote(""), "\"\"");
    }

    #[test]
    fn test_pg_dump_display() {
        let scope = DumpScope {
            tables: &["users".to_string(), "orders".to_string()],
            ..DumpScope::default()
        };
        let plan = backup_plan(&pg_config(), "app", &scope, Path::new("/b/app.sql")).unwrap();
        assert_eq!(
            plan.display(),
            "PGPASSWORD='s3cret' pg_dump -h db.local -p 5433 -U admin --clean --if-exists -t users -t orders --no-owner --no-acl app > /b/app.sql"
        );

        let data = DumpScope {
            data_only: true,
            ..DumpScope::default()
        };
        let plan = backup_plan(&pg_config(), "app", &data, Path::new("/b/app.sql")).unwrap();
        assert!(plan.display().contains("--data-only --no-owner"));
    }

    #[test]
    fn test_pg_restore_resets_schema_first() {
        let plan = restore_plan(&pg_config(), "app", false, Path::new("/b/app.sql")).unwrap();
        assert_eq!(plan.steps.len(), 2);
        let display = plan.display();
        assert!(display.contains(
            "-d app -c \"DROP SCHEMA public CASCADE; CREATE SCHEMA public;\" && PGPASSWORD='s3cret' psql -h db.local -p 5433 -U admin -d app < /b/app.sql"
        ));

        let data_only = restore_plan(&pg_config(), "app", true, Path::new("/b/app.sql")).unwrap();
        assert_eq!(data_only.steps.len(), 1);
    }

    #[test]
    fn test_mysql_display() {
        let mut config = ConnectionConfig::new(DatabaseType::Mysql);
        config.host = Some("m".to_string());
        config.password = Some("pw".to_string());
        let scope = DumpScope {
            schema_only: true,
            tables: &["t1".to_string()],
            ..DumpScope::default()
        };
        let dump = backup_plan(&config, "shop", &scope, Path::new("/b/shop.sql")).unwrap();
        assert_eq!(dump.display(), "mysqldump -h m -P 3306 -u root -ppw --no-data shop t1 > /b/shop.sql");

        let restore = restore_plan(&config, "shop", false, Path::new("/b/shop.sql")).unwrap();
        assert_eq!(restore.display(), "mysql -h m -P 3306 -u root -ppw shop < /b/shop.sql");
    }

    #[test]
    fn test_mongo_display() {
        let mut config = ConnectionConfig::new(DatabaseType::Mongodb);
        config.connection_string = Some("mongodb://u:p@h:27017/?authSource=admin".to_string());
        let dump = backup_plan(&config, "shop", &DumpScope::default(), Path::new("/b/shop.archive")).unwrap();
        assert_eq!(
            dump.display(),
            "mongodump --uri=\"mongodb://u:p@h:27017/?authSource=admin\" --db=shop --archive=/b/shop.archive"
        );
        let restore = restore_plan(&config, "shop", false, Path::new("/b/shop.archive")).unwrap();
        assert!(restore.display().ends_with("--db=shop --archive=/b/shop.archive --drop"));
    }

    #[test]
    fn test_sqlite_display() {
        let mut config = ConnectionConfig::new(DatabaseType::Sqlite);
        config.file_path = Some("/data/app.db".to_string());
        let dump = backup_plan(&config, "app", &DumpScope::default(), Path::new("/b/app.sql")).unwrap();
        assert_eq!(dump.display(), "sqlite3 /data/app.db .dump > /b/app.sql");
        let restore = restore_plan(&config, "app", false, Path::new("/b/app.sql")).unwrap();
        assert_eq!(restore.display(), "sqlite3 /data/app.db < /b/app.sql");
    }

    #[test]
    fn test_mssql_is_unsupported() {
        let config = ConnectionConfig::new(DatabaseType::Mssql);
        let err = backup_plan(&config, "db", &DumpScope::default(), Path::new("/b/x")).unwrap_err();
        assert_eq!(err.to_string(), "Backup is not supported for SQL Server connections");
        let err = restore_plan(&config, "db", false, Path::new("/b/x")).unwrap_err();
        assert_eq!(err.to_string(), "Restore is not supported for SQL Server connections");
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("PGPASSWORD='s3cret' pg_dump -h h"), "PGPASSWORD='****' pg_dump -h h");
        assert_eq!(redact("PGPASSWORD=s3cret psql"), "PGPASSWORD=**** psql");
        assert_eq!(redact("PGPASSWORD='it'\\''s' psql"), "PGPASSWORD='****' psql");
        assert_eq!(redact("mysqldump -u root -phunter2 shop"), "mysqldump -u root -p**** shop");
        assert_eq!(redact("tool \"--password=a b\" x"), "tool \"--password=****\" x");
        assert_eq!(redact("tool --password=abc x"), "tool --password=**** x");
        assert_eq!(
            redact("mongodump --uri=\"mongodb://app:pw@h:27017/\""),
            "mongodump --uri=\"mongodb://app:****@h:27017/\""
        );
        // Port flags are left alone
        assert_eq!(redact("psql -h h -p 5432 -U u"), "psql -h h -p 5432 -U u");
    }

    #[test]
    fn test_redact_quoted_mysql_passwords() {
        for password in ["a b", "it's", "a\"b$c", "plain"] {
            let mut config = ConnectionConfig::new(DatabaseType::Mysql);
            config.host = Some("m".to_string());
            config.password = Some(password.to_string());

            let dump = backup_plan(&config, "shop", &DumpScope::default(), Path::new("/b/shop.sql")).unwrap();
            let restore = restore_plan(&config, "shop", false, Path::new("/b/shop.sql")).unwrap();
            for line in [redact(&dump.display()), redact(&restore.display())] {
                assert!(!line.contains(password), "{} leaked in {}", password, line);
                assert!(line.contains("-p****"), "{}", line);
                assert!(line.contains(" shop"), "{}", line);
            }
        }
    }

    #[test]
    fn test_search_path_includes_tool_dirs() {
        let path = tool_search_path(&[PathBuf::from("/custom/bin")]).unwrap();
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert_eq!(dirs[0], PathBuf::from("/custom/bin"));
        assert!(dirs.contains(&PathBuf::from("/opt/homebrew/bin")));
        assert!(dirs.contains(&PathBuf::from("/usr/local/bin")));
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let cmd = ToolCommand::new("polydb-no-such-tool");
        let err = run_step(&cmd, None, |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
