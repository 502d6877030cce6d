use clap::Parser;
use dirs::home_dir;
use serde::Serialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const BINARY_NAME: &str = "cokacdir";
const SERVICE_NAME: &str = "cokacdir";
const LAUNCHD_LABEL: &str = "com.cokacdir.server";
const SERVER_MODE_FLAG: &str = "--ccserver";

#[derive(Parser, Debug)]
#[command(
    name = "cokacdir-setup",
    version,
    about = "Install the cokacdir server as a systemd user service (Linux) or launchd user agent (macOS)"
)]
struct Cli {
    /// Secret tokens handed to the server; at least one is required.
    #[arg(required = true, value_name = "TOKEN")]
    tokens: Vec<String>,
    /// Print the outcome as a JSON envelope instead of human-readable text.
    #[arg(long)]
    json: bool,
    /// Render the wrapper script and service descriptor without writing files
    /// or registering anything with the service manager.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Error)]
enum SetupError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("platform error: {0}")]
    Platform(String),
    #[error("io error: {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("process error: {0}")]
    Process(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    json: bool,
    dry_run: bool,
}

/// Ambient process state, captured once at startup so every component can be
/// exercised against a synthetic environment in tests.
#[derive(Debug, Clone)]
struct Env {
    os: String,
    home: PathBuf,
    user: Option<String>,
    path_var: Option<String>,
    state_home: Option<String>,
}

impl Env {
    fn capture() -> Result<Self, SetupError> {
        let home = home_dir().ok_or_else(|| {
            SetupError::Usage(
                "unable to resolve the home directory; set HOME to an existing directory"
                    .to_string(),
            )
        })?;
        Ok(Self {
            os: env::consts::OS.to_string(),
            home,
            user: env::var("USER").ok().filter(|value| !value.is_empty()),
            path_var: env::var("PATH").ok(),
            state_home: env::var("XDG_STATE_HOME")
                .ok()
                .filter(|value| !value.is_empty()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Linux,
    Darwin,
}

impl Platform {
    fn detect(os: &str) -> Option<Self> {
        match os {
            "linux" => Some(Self::Linux),
            "macos" => Some(Self::Darwin),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
        }
    }

    fn login_shell(self) -> &'static str {
        match self {
            Self::Linux => "/bin/bash",
            Self::Darwin => "/bin/zsh",
        }
    }
}

#[derive(Debug, Clone)]
struct ServicePaths {
    descriptor: PathBuf,
    log_dir: PathBuf,
    wrapper: PathBuf,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
}

fn resolve_service_paths(platform: Platform, env: &Env) -> ServicePaths {
    let (descriptor, log_dir) = match platform {
        Platform::Linux => {
            let descriptor = env
                .home
                .join(".config")
                .join("systemd")
                .join("user")
                .join(format!("{SERVICE_NAME}.service"));
            let state_root = env
                .state_home
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| env.home.join(".local").join("state"));
            (descriptor, state_root.join(SERVICE_NAME))
        }
        Platform::Darwin => {
            let descriptor = env
                .home
                .join("Library")
                .join("LaunchAgents")
                .join(format!("{LAUNCHD_LABEL}.plist"));
            let log_dir = env.home.join("Library").join("Logs").join(SERVICE_NAME);
            (descriptor, log_dir)
        }
    };
    let wrapper = log_dir.join(format!("{SERVICE_NAME}-wrapper.sh"));
    let stdout_log = log_dir.join(format!("{SERVICE_NAME}.log"));
    let stderr_log = log_dir.join(format!("{SERVICE_NAME}.error.log"));
    ServicePaths {
        descriptor,
        log_dir,
        wrapper,
        stdout_log,
        stderr_log,
    }
}

#[derive(Debug, Serialize)]
struct InstallReport {
    platform: String,
    binary: String,
    descriptor: String,
    wrapper: String,
    log_file: String,
    error_log_file: String,
    updated: bool,
    commands: ReportCommands,
}

#[derive(Debug, Serialize)]
struct ReportCommands {
    status: String,
    logs: String,
    stop: String,
    remove: String,
}

#[derive(Debug, Serialize)]
struct DryRunReport {
    platform: String,
    binary: String,
    dry_run: bool,
    descriptor_path: String,
    wrapper_path: String,
    descriptor: String,
    wrapper: String,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, io::Error>;
}

struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(program).args(args).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn run_fatal<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[&str],
) -> Result<String, SetupError> {
    let output = runner
        .run(program, args)
        .map_err(|err| SetupError::Process(format!("failed to execute {program}: {err}")))?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let detail = if stderr.is_empty() {
            format!("exit status {}", output.status_code)
        } else {
            stderr.to_string()
        };
        return Err(SetupError::Process(format!(
            "{program} {} failed: {detail}",
            args.join(" ")
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_best_effort<R: CommandRunner>(runner: &R, program: &str, args: &[&str]) -> bool {
    match runner.run(program, args) {
        Ok(output) => output.success(),
        Err(_) => false,
    }
}

fn main() {
    let cli = Cli::parse();
    let ctx = Context {
        json: cli.json,
        dry_run: cli.dry_run,
    };
    let result =
        Env::capture().and_then(|env| handle_install(ctx, &env, &RealCommandRunner, &cli.tokens));
    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            if let Ok(text) = serde_json::to_string_pretty(&payload) {
                println!("{text}");
            }
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
}

fn handle_install<R: CommandRunner>(
    ctx: Context,
    env: &Env,
    runner: &R,
    tokens: &[String],
) -> Result<(), SetupError> {
    validate_tokens(tokens)?;

    let platform = Platform::detect(&env.os).ok_or_else(|| {
        SetupError::Platform(format!(
            "unsupported platform: {}; this tool supports Linux and macOS only",
            env.os
        ))
    })?;

    let binary = find_in_path(BINARY_NAME, env.path_var.as_deref()).ok_or_else(|| {
        SetupError::Usage(format!(
            "{BINARY_NAME} not found in PATH; install {BINARY_NAME} first, then retry"
        ))
    })?;

    let paths = resolve_service_paths(platform, env);
    let rendered = render_descriptors(platform, runner, &binary, &paths, tokens);

    if ctx.dry_run {
        return emit_dry_run(ctx, platform, &binary, &paths, &rendered);
    }

    // launchd domain targets need the numeric uid before any mutation.
    let uid = match platform {
        Platform::Darwin => Some(run_fatal(runner, "id", &["-u"])?),
        Platform::Linux => None,
    };

    ensure_parent(&paths.descriptor)?;
    fs::create_dir_all(&paths.log_dir).map_err(|err| io_error(&paths.log_dir, err))?;

    // The wrapper must land on disk before the descriptor that points at it.
    write_file_with_mode(&paths.wrapper, &rendered.wrapper, 0o700)?;

    let updated = paths.descriptor.exists();
    if updated {
        if !ctx.json {
            println!("Existing service found. Stopping before update...");
        }
        if !stop_existing(platform, runner, &paths, uid.as_deref()) {
            eprintln!("warning: could not stop the existing service; it may keep running with stale settings");
            eprintln!("warning: run manually: {}", stop_command(platform, &paths));
        }
    }

    write_file_with_mode(&paths.descriptor, &rendered.descriptor, 0o600)?;
    if !ctx.json {
        if updated {
            println!("Service file updated: {}", paths.descriptor.display());
        } else {
            println!("Service file created: {}", paths.descriptor.display());
        }
    }

    match platform {
        Platform::Linux => register_systemd(ctx, env, runner)?,
        Platform::Darwin => {
            let uid = uid.as_deref().unwrap_or_default();
            register_launchd(runner, &paths, uid)?;
        }
    }

    let report = build_report(platform, &binary, &paths, updated);
    if ctx.json {
        print_json(&JsonResult {
            ok: true,
            result: Some(report),
            error: None,
        })
    } else {
        print_summary(&report);
        Ok(())
    }
}

fn validate_tokens(tokens: &[String]) -> Result<(), SetupError> {
    if tokens.is_empty() {
        return Err(SetupError::Usage(
            "at least one token is required".to_string(),
        ));
    }
    for (index, token) in tokens.iter().enumerate() {
        if token.trim().is_empty() {
            return Err(SetupError::Usage(format!(
                "token {} is blank; tokens must contain non-whitespace characters",
                index + 1
            )));
        }
    }
    Ok(())
}

fn stop_existing<R: CommandRunner>(
    platform: Platform,
    runner: &R,
    paths: &ServicePaths,
    uid: Option<&str>,
) -> bool {
    match platform {
        Platform::Linux => {
            run_best_effort(runner, "systemctl", &["--user", "stop", SERVICE_NAME])
        }
        Platform::Darwin => {
            let uid = uid.unwrap_or_default();
            let target = format!("gui/{uid}/{LAUNCHD_LABEL}");
            if run_best_effort(runner, "launchctl", &["bootout", &target]) {
                return true;
            }
            let plist = paths.descriptor.to_string_lossy();
            run_best_effort(runner, "launchctl", &["unload", &plist])
        }
    }
}

fn stop_command(platform: Platform, paths: &ServicePaths) -> String {
    match platform {
        Platform::Linux => format!("systemctl --user stop {SERVICE_NAME}"),
        Platform::Darwin => format!("launchctl unload {}", paths.descriptor.display()),
    }
}

fn register_systemd<R: CommandRunner>(
    ctx: Context,
    env: &Env,
    runner: &R,
) -> Result<(), SetupError> {
    run_fatal(runner, "systemctl", &["--user", "daemon-reload"])?;
    run_fatal(runner, "systemctl", &["--user", "enable", SERVICE_NAME])?;
    run_fatal(runner, "systemctl", &["--user", "restart", SERVICE_NAME])?;

    match env.user.as_deref() {
        Some(user) => {
            if run_best_effort(runner, "loginctl", &["enable-linger", user]) {
                if !ctx.json {
                    println!("Linger enabled: the service will start at boot.");
                }
            } else {
                eprintln!("warning: could not enable linger; the service may not start at boot");
                eprintln!("warning: run manually: loginctl enable-linger {user}");
            }
        }
        None => {
            eprintln!("warning: USER is not set; skipping loginctl enable-linger");
        }
    }
    Ok(())
}

fn register_launchd<R: CommandRunner>(
    runner: &R,
    paths: &ServicePaths,
    uid: &str,
) -> Result<(), SetupError> {
    let target = format!("gui/{uid}/{LAUNCHD_LABEL}");
    let domain = format!("gui/{uid}");
    let plist = paths.descriptor.to_string_lossy();

    if !run_best_effort(runner, "launchctl", &["enable", &target]) {
        eprintln!("warning: could not enable the launch agent; continuing");
        eprintln!("warning: run manually: launchctl enable {target}");
    }

    // `bootstrap` is the modern registration path; fall back to the legacy
    // `load` verb on older macOS releases.
    if !run_best_effort(runner, "launchctl", &["bootstrap", &domain, &plist]) {
        run_fatal(runner, "launchctl", &["load", &plist])?;
    }
    Ok(())
}

fn build_report(
    platform: Platform,
    binary: &Path,
    paths: &ServicePaths,
    updated: bool,
) -> InstallReport {
    let commands = match platform {
        Platform::Linux => ReportCommands {
            status: format!("systemctl --user status {SERVICE_NAME}"),
            logs: format!("tail -f {}", paths.stdout_log.display()),
            stop: stop_command(platform, paths),
            remove: format!(
                "systemctl --user disable {SERVICE_NAME} && rm {}",
                paths.descriptor.display()
            ),
        },
        Platform::Darwin => ReportCommands {
            status: format!("launchctl list | grep {LAUNCHD_LABEL}"),
            logs: format!("tail -f {}", paths.stdout_log.display()),
            stop: stop_command(platform, paths),
            remove: format!("launchctl unload {0} && rm {0}", paths.descriptor.display()),
        },
    };
    InstallReport {
        platform: platform.as_str().to_string(),
        binary: binary.display().to_string(),
        descriptor: paths.descriptor.display().to_string(),
        wrapper: paths.wrapper.display().to_string(),
        log_file: paths.stdout_log.display().to_string(),
        error_log_file: paths.stderr_log.display().to_string(),
        updated,
        commands,
    }
}

fn print_summary(report: &InstallReport) {
    println!();
    println!("------------------------------------------------");
    println!("Setup complete!");
    println!("Status : {}", report.commands.status);
    println!("Logs   : {}", report.commands.logs);
    println!("Stop   : {}", report.commands.stop);
    println!("Remove : {}", report.commands.remove);
    println!("------------------------------------------------");
}

fn emit_dry_run(
    ctx: Context,
    platform: Platform,
    binary: &Path,
    paths: &ServicePaths,
    rendered: &RenderedService,
) -> Result<(), SetupError> {
    if ctx.json {
        let report = DryRunReport {
            platform: platform.as_str().to_string(),
            binary: binary.display().to_string(),
            dry_run: true,
            descriptor_path: paths.descriptor.display().to_string(),
            wrapper_path: paths.wrapper.display().to_string(),
            descriptor: rendered.descriptor.clone(),
            wrapper: rendered.wrapper.clone(),
        };
        print_json(&JsonResult {
            ok: true,
            result: Some(report),
            error: None,
        })
    } else {
        println!("# {}", paths.wrapper.display());
        println!("{}", rendered.wrapper);
        println!("# {}", paths.descriptor.display());
        println!("{}", rendered.descriptor);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RenderedService {
    wrapper: String,
    descriptor: String,
}

fn render_descriptors<R: CommandRunner>(
    platform: Platform,
    runner: &R,
    binary: &Path,
    paths: &ServicePaths,
    tokens: &[String],
) -> RenderedService {
    let shell = platform.login_shell();
    let wrapper = render_wrapper_script(shell, binary, tokens);
    let descriptor = match platform {
        Platform::Linux => {
            let directive = log_directive_for(systemd_version(runner));
            render_systemd_unit(
                &paths.wrapper,
                &paths.stdout_log,
                &paths.stderr_log,
                directive,
            )
        }
        Platform::Darwin => {
            render_launchd_plist(shell, &paths.wrapper, &paths.stdout_log, &paths.stderr_log)
        }
    };
    RenderedService {
        wrapper,
        descriptor,
    }
}

/// The wrapper re-creates the user's interactive login environment and is the
/// only file the tokens are ever written into; the service descriptors
/// reference the wrapper path and nothing else.
fn render_wrapper_script(shell: &str, binary: &Path, tokens: &[String]) -> String {
    let mut line = format!(
        "exec {} {SERVER_MODE_FLAG} --",
        shell_single_quote(&binary.to_string_lossy())
    );
    for token in tokens {
        line.push(' ');
        line.push_str(&shell_single_quote(token));
    }
    format!("#!{shell} -il\n{line}\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogDirective {
    Append,
    Truncate,
    Journal,
}

fn log_directive_for(version: u32) -> LogDirective {
    if version >= 240 {
        LogDirective::Append
    } else if version >= 236 {
        LogDirective::Truncate
    } else {
        LogDirective::Journal
    }
}

fn log_sink(directive: LogDirective, path: &Path) -> String {
    match directive {
        LogDirective::Append => format!(
            "append:{}",
            systemd_escape_specifiers(&path.to_string_lossy())
        ),
        LogDirective::Truncate => format!(
            "file:{}",
            systemd_escape_specifiers(&path.to_string_lossy())
        ),
        LogDirective::Journal => "journal".to_string(),
    }
}

fn render_systemd_unit(
    wrapper: &Path,
    stdout_log: &Path,
    stderr_log: &Path,
    directive: LogDirective,
) -> String {
    format!(
        "[Unit]\nDescription=Cokacdir Server Service\nAfter=network.target\n\n[Service]\nType=simple\nExecStart={exec_start}\nRestart=always\nRestartSec=5\nStandardOutput={stdout_sink}\nStandardError={stderr_sink}\n\n[Install]\nWantedBy=default.target\n",
        exec_start = systemd_quote(&wrapper.to_string_lossy()),
        stdout_sink = log_sink(directive, stdout_log),
        stderr_sink = log_sink(directive, stderr_log),
    )
}

fn render_launchd_plist(
    shell: &str,
    wrapper: &Path,
    stdout_log: &Path,
    stderr_log: &Path,
) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n<plist version=\"1.0\">\n<dict>\n    <key>Label</key>\n    <string>{label}</string>\n    <key>ProgramArguments</key>\n    <array>\n        <string>{shell}</string>\n        <string>-l</string>\n        <string>-i</string>\n        <string>{wrapper}</string>\n    </array>\n    <key>RunAtLoad</key>\n    <true/>\n    <key>KeepAlive</key>\n    <true/>\n    <key>StandardOutPath</key>\n    <string>{stdout_log}</string>\n    <key>StandardErrorPath</key>\n    <string>{stderr_log}</string>\n</dict>\n</plist>\n",
        label = xml_escape(LAUNCHD_LABEL),
        shell = xml_escape(shell),
        wrapper = xml_escape(&wrapper.to_string_lossy()),
        stdout_log = xml_escape(&stdout_log.to_string_lossy()),
        stderr_log = xml_escape(&stderr_log.to_string_lossy()),
    )
}

fn shell_single_quote(value: &str) -> String {
    // Bash-safe single-quoted string: close/open around escaped single quotes.
    // Example: foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn is_xml_illegal_control(ch: char) -> bool {
    matches!(ch, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}')
}

/// Removes the C0 controls that XML 1.0 forbids even in escaped form; tab,
/// newline, and carriage return stay.
fn strip_xml_control(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !is_xml_illegal_control(*ch))
        .collect()
}

fn xml_escape(value: &str) -> String {
    // Ampersand first, or the entities below would be escaped twice.
    strip_xml_control(value)
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Quotes a value for a systemd unit-file assignment: backslash first so the
/// later substitutions are not re-escaped, `$` and `%` doubled to defeat
/// variable and specifier expansion, whitespace controls turned into their
/// literal escapes, and the result wrapped in double quotes so it stays a
/// single token.
fn systemd_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "$$")
        .replace('%', "%%")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t");
    let cleaned: String = escaped
        .chars()
        .filter(|ch| !matches!(ch, '\u{0}'..='\u{1f}'))
        .collect();
    format!("\"{cleaned}\"")
}

fn systemd_escape_specifiers(value: &str) -> String {
    value.replace('$', "$$").replace('%', "%%")
}

fn systemd_version<R: CommandRunner>(runner: &R) -> u32 {
    let Ok(output) = runner.run("systemctl", &["--version"]) else {
        return 0;
    };
    if !output.success() {
        return 0;
    }
    parse_systemd_version(&String::from_utf8_lossy(&output.stdout))
}

/// First run of digits after the `systemd` marker, e.g. `systemd 252
/// (252.4-2)` parses as 252. Anything unexpected maps to 0, the most
/// conservative tier.
fn parse_systemd_version(output: &str) -> u32 {
    let Some(index) = output.find("systemd") else {
        return 0;
    };
    let rest = &output[index + "systemd".len()..];
    let digits: String = rest
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

fn find_in_path(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    let path_var = path_var?;
    for segment in path_var.split(':') {
        if segment.is_empty() {
            continue;
        }
        let candidate = Path::new(segment).join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn io_error(path: &Path, source: io::Error) -> SetupError {
    SetupError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn ensure_parent(path: &Path) -> Result<(), SetupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
    }
    Ok(())
}

fn write_file_with_mode(path: &Path, content: &str, mode: u32) -> Result<(), SetupError> {
    fs::write(path, content).map_err(|err| io_error(path, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| io_error(path, err))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SetupError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}
