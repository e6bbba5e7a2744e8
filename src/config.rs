//! 配置模块，负责加载JSON配置文件

use crate::error::ConfigError;
use crate::processor::ProcessorDefinition;
use crate::relation::{RelationDefinition, RelationInference};
use crate::sql_compiler::SqlDialect;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 全局查询名称，不能作为数据源名称
pub const GLOBAL_SOURCE: &str = "global";

fn default_limit() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_ttl_seconds() -> i64 {
    600
}

/// 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// 每个查询的最大行数，同时也是关系数量上限
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    pub sources: Vec<SourceConfig>,
    /// 按顺序执行的后处理插件
    #[serde(default)]
    pub processors: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

/// 数据源配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub name: String,
    /// 是否参与 `global` 查询
    #[serde(default)]
    pub in_global: bool,
    /// 数据源是否有 `datetime` 字段
    #[serde(default)]
    pub include_datetime: bool,
    /// 数据源能否自己处理 AND/OR/IN，否则查询会被拆分
    #[serde(default, alias = "supportsSQL")]
    pub supports_native_booleans: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 结果过多时统计的字段
    #[serde(default)]
    pub stats_fields: Vec<String>,
    /// 用户字段名 → 数据源字段名
    #[serde(default)]
    pub replace_fields: HashMap<String, String>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
    /// 按记录类型在运行时推断新的关系定义
    #[serde(default)]
    pub infer_relations: Option<RelationInference>,
    pub backend: BackendKind,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 后端类型及其连接参数
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite {
        path: PathBuf,
        table: String,
        /// 打开数据库后执行的SQL脚本
        #[serde(default)]
        seed: Option<String>,
        #[serde(default)]
        dialect: SqlDialect,
    },
    Document {
        path: PathBuf,
    },
    #[serde(rename = "keyvalue")]
    KeyValue {
        path: PathBuf,
        field: String,
    },
}

impl BackendKind {
    /// 相对路径以配置文件所在目录为基准
    fn resolve_paths(&mut self, base: &Path) {
        let path = match self {
            BackendKind::Sqlite { path, .. } if path.as_os_str() == ":memory:" => return,
            BackendKind::Sqlite { path, .. } | BackendKind::Document { path } | BackendKind::KeyValue { path, .. } => path,
        };
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

impl ServerConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::NotFound(path_ref.to_path_buf()));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let mut config: ServerConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let base = path_ref.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut config.sources {
            source.backend.resolve_paths(base);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::Invalid("limit must be greater than 0".to_string()));
        }
        if self.cache.enabled && self.cache.ttl_seconds <= 0 {
            return Err(ConfigError::Invalid("cache TTL must be positive".to_string()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ConfigError::Invalid("source name can't be empty".to_string()));
            }
            if source.name == GLOBAL_SOURCE {
                return Err(ConfigError::Invalid(format!("'{}' is a reserved source name", GLOBAL_SOURCE)));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source '{}'", source.name)));
            }
        }
        Ok(())
    }
}
