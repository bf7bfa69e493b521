use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_initial_queries() -> usize {
    3
}

fn default_max_loops() -> usize {
    2
}

fn default_query_generator_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_reflection_model() -> String {
    "gemini-2.5-flash-preview-04-17".to_string()
}

fn default_answer_model() -> String {
    "gemini-2.5-pro-preview-05-06".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub models: ModelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResearchConfig {
    #[serde(default = "default_initial_queries")]
    pub number_of_initial_queries: usize,
    #[serde(default = "default_max_loops")]
    pub max_research_loops: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default = "default_query_generator_model")]
    pub query_generator_model: String,
    #[serde(default = "default_reflection_model")]
    pub reflection_model: String,
    #[serde(default = "default_answer_model")]
    pub answer_model: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            number_of_initial_queries: default_initial_queries(),
            max_research_loops: default_max_loops(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            query_generator_model: default_query_generator_model(),
            reflection_model: default_reflection_model(),
            answer_model: default_answer_model(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Error parsing config.toml: {}. Using defaults.", e),
                },
                Err(e) => eprintln!("Error reading config.toml: {}. Using defaults.", e),
            }
        }

        Config::default()
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/pro-search/config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}
