use attendance_core::{SuccessPolicy, MAX_UPLOAD_BYTES};
use attendance_runner::interpreter::{DEFAULT_CANDIDATES, DEFAULT_REQUIRED_MODULES};
use std::path::PathBuf;

const DEFAULT_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:5173"];

/// Hosting platforms recognised by their marker variables.
const PLATFORM_FLAGS: [(&str, &str); 4] = [
    ("RAILWAY_ENVIRONMENT", "Railway"),
    ("RENDER", "Render"),
    ("HEROKU", "Heroku"),
    ("VERCEL", "Vercel"),
];

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on (default: 3001).
    pub port: u16,
    /// Externally reachable API base URL advertised to clients.
    pub public_api_url: Option<String>,
    /// Browser origins allowed for cross-origin requests.
    pub allowed_origins: Vec<String>,
    /// Deployment environment name, e.g. "production" or "development".
    pub environment: String,
    /// Hosting platform detected from its marker variable, if any.
    pub platform: Option<String>,
    /// Recognition script handed to the interpreter.
    pub script_path: PathBuf,
    /// Interpreter names probed in order at startup.
    pub interpreters: Vec<String>,
    /// Packages whose import is checked by `/api/diagnostics`.
    pub required_modules: Vec<String>,
    /// Wall-clock deadline for one recognition run.
    pub timeout_secs: u64,
    /// Directory for per-request upload files.
    pub upload_dir: PathBuf,
    /// Largest accepted image in bytes.
    pub max_upload_bytes: usize,
    /// Maximum number of recognition processes alive at once.
    pub max_concurrent: usize,
    /// How long a submission waits for a free recognition slot.
    pub queue_timeout_secs: u64,
    /// Path to the SQLite attendance ledger.
    pub db_path: PathBuf,
    /// Whether failure responses carry the `debug` object and operator
    /// endpoints are served.
    pub expose_debug: bool,
    /// Treat a zero exit without any success marker as success.
    pub lenient_success: bool,
}

impl Config {
    /// Load configuration from `ATTEND_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let environment = get("ATTEND_ENV")
            .or_else(|| get("NODE_ENV"))
            .unwrap_or_else(|| "development".to_string());
        let production = environment == "production";

        let platform = PLATFORM_FLAGS
            .iter()
            .find(|(flag, _)| get(flag).is_some_and(|v| !v.is_empty()))
            .map(|(_, name)| name.to_string());

        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("attendance");

        let default_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            port: get("ATTEND_PORT")
                .or_else(|| get("PORT"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
            public_api_url: get("ATTEND_PUBLIC_API_URL").filter(|v| !v.is_empty()),
            allowed_origins: get("ATTEND_ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| DEFAULT_ORIGINS.iter().map(|s| s.to_string()).collect()),
            environment,
            platform,
            script_path: get("ATTEND_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recognize.py")),
            interpreters: get("ATTEND_INTERPRETERS")
                .map(|v| split_list(&v))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CANDIDATES.iter().map(|s| s.to_string()).collect()),
            // An empty value turns the import checks off.
            required_modules: get("ATTEND_REQUIRED_MODULES")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| DEFAULT_REQUIRED_MODULES.iter().map(|s| s.to_string()).collect()),
            timeout_secs: parse_or(&get, "ATTEND_TIMEOUT_SECS", 30),
            upload_dir: get("ATTEND_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("attendance-uploads")),
            max_upload_bytes: parse_or(&get, "ATTEND_MAX_UPLOAD_BYTES", MAX_UPLOAD_BYTES),
            max_concurrent: parse_or(&get, "ATTEND_MAX_CONCURRENT", default_concurrency).max(1),
            queue_timeout_secs: parse_or(&get, "ATTEND_QUEUE_TIMEOUT_SECS", 5),
            db_path: get("ATTEND_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            expose_debug: get("ATTEND_EXPOSE_DEBUG")
                .map(|v| v != "0")
                .unwrap_or(!production),
            lenient_success: get("ATTEND_LENIENT_SUCCESS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Hosted deployments widen the CORS allow-list and run the
    /// recognition script in server mode.
    pub fn is_cloud(&self) -> bool {
        self.platform.is_some() || self.is_production()
    }

    pub fn success_policy(&self) -> SuccessPolicy {
        if self.lenient_success {
            SuccessPolicy::Lenient
        } else {
            SuccessPolicy::Strict
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "invalid value; using default");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = load(&[("HOME", "/home/u")]);
        assert_eq!(c.port, 3001);
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(c.interpreters, vec!["python3", "python", "python3.11", "python3.9"]);
        assert_eq!(c.required_modules, vec!["cv2", "face_recognition", "numpy"]);
        assert_eq!(c.db_path, PathBuf::from("/home/u/.local/share/attendance/attendance.db"));
        assert!(c.expose_debug);
        assert!(!c.is_cloud());
        assert_eq!(c.success_policy(), SuccessPolicy::Strict);
    }

    #[test]
    fn test_production_hides_debug() {
        let c = load(&[("NODE_ENV", "production")]);
        assert!(c.is_production());
        assert!(c.is_cloud());
        assert!(!c.expose_debug);

        let c = load(&[("NODE_ENV", "production"), ("ATTEND_EXPOSE_DEBUG", "1")]);
        assert!(c.expose_debug);
    }

    #[test]
    fn test_platform_flag_and_port_fallback() {
        let c = load(&[("RAILWAY_ENVIRONMENT", "prod"), ("PORT", "8080")]);
        assert_eq!(c.platform.as_deref(), Some("Railway"));
        assert!(c.is_cloud());
        assert_eq!(c.port, 8080);

        let c = load(&[("ATTEND_PORT", "9000"), ("PORT", "8080")]);
        assert_eq!(c.port, 9000);
    }

    #[test]
    fn test_lists_and_bad_numbers() {
        let c = load(&[
            ("ATTEND_ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("ATTEND_INTERPRETERS", "python3.12"),
            ("ATTEND_TIMEOUT_SECS", "soon"),
            ("ATTEND_MAX_CONCURRENT", "0"),
            ("ATTEND_REQUIRED_MODULES", ""),
        ]);
        assert!(c.required_modules.is_empty());
        assert_eq!(c.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(c.interpreters, vec!["python3.12"]);
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.max_concurrent, 1);
    }
}
