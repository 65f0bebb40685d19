use std::path::Path;

use idcycle_auth::AuthSessionBroker;
use idcycle_core::config::EngineConfig;
use idcycle_steps::StepRegistry;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn issue(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print one line per check; returns `true` when nothing needs attention.
pub fn run_doctor(config_path: &Path, config: &EngineConfig) -> bool {
    let checks = [
        check_config_file(config_path),
        check_retry(config),
        check_log_dir(config),
        check_auth_sessions(config),
        check_redaction(config),
        check_steps(),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn check_config_file(path: &Path) -> CheckResult {
    if path.exists() {
        CheckResult::ok("Config", path.display().to_string())
    } else {
        CheckResult::ok("Config", format!("{} not found, using defaults", path.display()))
    }
}

fn check_retry(config: &EngineConfig) -> CheckResult {
    let retry = &config.retry;
    match retry.validate() {
        Ok(()) => CheckResult::ok(
            "Retry",
            format!(
                "{} attempts, {}ms..{}ms (x{}, jitter {})",
                retry.max_attempts,
                retry.initial_backoff_ms,
                retry.max_backoff_ms,
                retry.backoff_multiplier,
                retry.jitter_ratio
            ),
        ),
        Err(e) => CheckResult::issue("Retry", e.to_string()),
    }
}

fn check_log_dir(config: &EngineConfig) -> CheckResult {
    let Some(dir) = config.log_dir() else {
        return CheckResult::ok("Run log", "Disabled (no log.dir)");
    };
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult::issue("Run log", format!("{} (cannot create: {})", dir.display(), e));
    }

    let probe = dir.join(".doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(_) => {
            std::fs::remove_file(&probe).ok();
            CheckResult::ok(
                "Run log",
                format!("{} (level {})", dir.display(), config.log.level),
            )
        }
        Err(e) => CheckResult::issue("Run log", format!("{} (not writable: {})", dir.display(), e)),
    }
}

fn check_auth_sessions(config: &EngineConfig) -> CheckResult {
    let Some(auth) = &config.auth else {
        return CheckResult::ok("Auth sessions", "Not configured (session steps will fail)");
    };

    let unexpanded: Vec<String> = auth
        .default
        .iter()
        .map(|d| ("default".to_string(), &d.credential))
        .chain(
            auth.sessions
                .iter()
                .enumerate()
                .map(|(i, r)| (format!("sessions[{}]", i), &r.credential)),
        )
        .filter(|(_, credential)| credential.is_empty() || credential.starts_with("${"))
        .map(|(label, _)| label)
        .collect();
    if !unexpanded.is_empty() {
        return CheckResult::issue(
            "Auth sessions",
            format!("Empty or unresolved credential: {}", unexpanded.join(", ")),
        );
    }

    match AuthSessionBroker::from_config(auth) {
        Ok(broker) => CheckResult::ok(
            "Auth sessions",
            format!(
                "{} routes, {}",
                broker.route_count(),
                if broker.has_default() { "default set" } else { "no default" }
            ),
        ),
        Err(e) => CheckResult::issue("Auth sessions", e.to_string()),
    }
}

fn check_redaction(config: &EngineConfig) -> CheckResult {
    let redaction = &config.redaction;
    if redaction.placeholder.is_empty() {
        return CheckResult::issue("Redaction", "placeholder must not be empty");
    }
    CheckResult::ok(
        "Redaction",
        format!("{} extra keys, placeholder '{}'", redaction.extra_keys.len(), redaction.placeholder),
    )
}

fn check_steps() -> CheckResult {
    let registry = StepRegistry::with_builtins();
    CheckResult::ok("Steps", registry.list().join(", "))
}
