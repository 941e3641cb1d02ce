// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;

use crate::battle::TimeoutPolicy;

/// Default model-inference endpoint for image generation.
pub const DEFAULT_GENERATION_API_URL: &str =
    "https://api-inference.huggingface.co/models/black-forest-labs/FLUX.1-dev";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Image-generation model endpoint.
    pub generation_api_url: String,
    /// Bearer token for the generation endpoint. Kept server-side only;
    /// when unset, generation requests fail with a configuration error.
    pub generation_api_token: Option<String>,
    /// Directory where generated images are stored and served from.
    pub images_dir: PathBuf,
    /// Directory containing pre-built frontend files to serve.
    /// When set, the backend serves static files from this path.
    pub static_dir: Option<PathBuf>,
    /// How timeout-triggered submissions with an empty prompt are handled.
    pub timeout_policy: TimeoutPolicy,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:promptduel.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `GENERATION_API_URL` - model endpoint (default: FLUX.1-dev on the HF inference API)
    /// - `HUGGINGFACE_TOKEN` - bearer token for the generation endpoint
    /// - `IMAGES_DIR` - where generated images are written (default: `./images`)
    /// - `STATIC_DIR` - path to frontend dist directory for static file serving
    /// - `TIMEOUT_POLICY` - `strict` or `permissive` (default: permissive)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:promptduel.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let generation_api_url = std::env::var("GENERATION_API_URL")
            .unwrap_or_else(|_| DEFAULT_GENERATION_API_URL.to_string());

        let generation_api_token = std::env::var("HUGGINGFACE_TOKEN").ok();

        let images_dir = std::env::var("IMAGES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./images"));

        let static_dir = std::env::var("STATIC_DIR").ok().map(PathBuf::from);

        let timeout_policy = std::env::var("TIMEOUT_POLICY")
            .map(|v| TimeoutPolicy::parse(&v))
            .unwrap_or_default();

        Config {
            database_url,
            port,
            generation_api_url,
            generation_api_token,
            images_dir,
            static_dir,
            timeout_policy,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_value() {
        let args: Vec<String> = vec!["prog".into(), "--port".into(), "8080".into()];
        assert_eq!(
            Config::parse_cli_value(&args, "--port"),
            Some("8080".to_string())
        );
        assert_eq!(Config::parse_cli_value(&args, "--missing"), None);
    }

    #[test]
    fn test_timeout_policy_parse() {
        assert_eq!(TimeoutPolicy::parse("strict"), TimeoutPolicy::Strict);
        assert_eq!(TimeoutPolicy::parse("STRICT"), TimeoutPolicy::Strict);
        assert_eq!(TimeoutPolicy::parse("permissive"), TimeoutPolicy::Permissive);
        assert_eq!(TimeoutPolicy::parse("nonsense"), TimeoutPolicy::Permissive);
    }
}
