use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub backend: Backend,
    pub live: Live,
    pub enrich: Enrich,
    pub limits: Limits,
    pub tables: Tables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub url: String,
    pub anon_key: String,
    pub schema: String,
    pub request_timeout_secs: u64,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Live {
    pub page_size: usize,
    pub max_backlog: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrich {
    pub concurrency: usize,
    pub placeholder_name: String,
    pub anonymous_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub comment_max_chars: usize,
    pub flag_reason_max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub stories: String,
    pub community_posts: String,
    pub comments: String,
    pub profiles: String,
    pub polls: String,
    pub reactions: String,
    pub flags: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: Backend {
                url: "http://localhost:54321".to_string(),
                anon_key: String::new(),
                schema: "public".to_string(),
                request_timeout_secs: 15,
                heartbeat_secs: 25,
            },
            live: Live {
                page_size: 10,
                max_backlog: 256,
            },
            enrich: Enrich {
                concurrency: 8,
                placeholder_name: "User".to_string(),
                anonymous_name: "Anonymous".to_string(),
            },
            limits: Limits {
                comment_max_chars: 2000,
                flag_reason_max_chars: 500,
            },
            tables: Tables {
                stories: "stories".to_string(),
                community_posts: "community_posts".to_string(),
                comments: "comments".to_string(),
                profiles: "profiles".to_string(),
                polls: "polls".to_string(),
                reactions: "reactions".to_string(),
                flags: "content_flags".to_string(),
            },
        }
    }
}

impl Settings {
    pub fn load() -> &'static Settings {
        SETTINGS.get_or_init(Self::load_from_files)
    }

    fn load_from_files() -> Settings {
        let default_path = Path::new("settings.default.ron");
        let override_path = Path::new("settings.ron");

        let mut settings = if default_path.exists() {
            fs::read_to_string(default_path)
                .ok()
                .and_then(|content| ron::from_str(&content).ok())
                .unwrap_or_default()
        } else {
            Settings::default()
        };

        if override_path.exists() {
            if let Ok(content) = fs::read_to_string(override_path) {
                if let Ok(overrides) = ron::from_str::<Settings>(&content) {
                    settings = overrides;
                }
            }
        }

        settings.apply_env();
        settings
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BACKEND_URL") {
            self.backend.url = url.trim_end_matches('/').to_string();
        }
        if let Ok(key) = std::env::var("BACKEND_ANON_KEY") {
            self.backend.anon_key = key;
        }
    }
}

pub fn settings() -> &'static Settings {
    Settings::load()
}
