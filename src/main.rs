use anyhow::{anyhow, Context, Result};
use query_federator::{Federator, SearchOptions, ServerConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "federator.json";

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

/// 配置文件路径：命令行参数 > FEDERATOR_CONFIG > 默认值
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("FEDERATOR_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn print_help() {
    println!("输入查询，例如: FROM global WHERE ip='8.8.8.8' LIMIT 10");
    println!("  .sources  列出数据源");
    println!("  .fields   列出可查询字段");
    println!("  .help     显示帮助");
    println!("  .quit     退出");
    println!("查询过程中按 Ctrl-C 取消");
}

/// 执行查询，Ctrl-C 取消所有后端任务
async fn run_query(federator: &Federator, line: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = federator.query(line, &SearchOptions::with_cancel(cancel)).await;
    watcher.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    match &result.error {
        Some(error) => println!("❌ {}", error),
        None if result.truncated => println!("⚠️ 结果过多，已返回统计信息"),
        None => println!("✅ {} 条关系", result.relations.len()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_tracing_subscriber();

    let path = config_path();
    let config = ServerConfig::from_json_file(&path).with_context(|| format!("无法加载配置 {}", path.display()))?;
    let federator = Federator::from_config(&config)?;

    println!("--- Query Federator ---");
    println!("✅ 已加载 {} 个数据源", federator.registry().len());
    print_help();

    let mut rl = DefaultEditor::new().map_err(|e| anyhow!("failed to init rustyline: {e}"))?;
    loop {
        let line = match rl.readline("federator> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => continue,
            Err(e) => return Err(anyhow!("readline error: {e}")),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line)
            .map_err(|e| anyhow!("failed to record history: {e}"))?;

        match line {
            ".quit" | ".exit" => break,
            ".help" => print_help(),
            ".sources" => {
                for backend in federator.registry().snapshot().values() {
                    let global = if backend.config.in_global { " (global)" } else { "" };
                    println!("  {}{}", backend.name(), global);
                }
            }
            ".fields" => println!("{}", federator.registry().field_list().await.join(", ")),
            query => {
                if let Err(e) = run_query(&federator, query).await {
                    eprintln!("✗ {}", e);
                }
            }
        }
    }

    Ok(())
}
