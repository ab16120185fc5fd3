use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use jobs_core::config::AppConfig;
use jobs_core::models::RunStatus;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use admin_jobs::app::Application;
use admin_jobs::shutdown::ShutdownManager;

fn cli() -> Command {
    Command::new("admin-jobs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("后台管理系统定时任务调度与执行引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("serve").about("启动调度服务，直到收到关闭信号"))
        .subcommand(
            Command::new("trigger")
                .about("手动触发一次任务，并以JSON行输出执行日志")
                .arg(
                    Arg::new("job-id")
                        .long("job-id")
                        .value_name("ID")
                        .help("任务ID")
                        .value_parser(value_parser!(i64))
                        .required(true),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
    }

    match matches.subcommand() {
        Some(("trigger", sub)) => trigger(config, sub).await,
        _ => serve(config).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("启动定时任务调度服务");
    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 等待执行中任务的超时由调度器配置控制
    match app_handle.await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用运行失败: {e:#}"),
        Err(e) => error!("应用关闭时发生错误: {e}"),
    }

    info!("定时任务调度服务已退出");
    Ok(())
}

async fn trigger(config: AppConfig, matches: &ArgMatches) -> Result<()> {
    let job_id = *matches
        .get_one::<i64>("job-id")
        .context("缺少参数 --job-id")?;

    let app = Application::new(config).await?;
    let run = app
        .trigger_once(job_id, |event| {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        })
        .await?;

    println!("{}", serde_json::to_string(&run)?);
    if run.status == RunStatus::Failed {
        anyhow::bail!(
            "任务执行失败: {}",
            run.exception.or(run.message).unwrap_or_default()
        );
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // 日志写到stderr，stdout留给 trigger 模式的事件输出
    match log_format {
        "json" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("指标监听地址无效: {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;
    info!("Prometheus指标导出器已启动: {addr}");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_trigger() {
        let matches = cli()
            .try_get_matches_from(["admin-jobs", "--log-format", "json", "trigger", "--job-id", "7"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("log-format").map(String::as_str),
            Some("json")
        );
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "trigger");
        assert_eq!(sub.get_one::<i64>("job-id"), Some(&7));
    }

    #[test]
    fn test_cli_rejects_unknown_log_level() {
        assert!(cli()
            .try_get_matches_from(["admin-jobs", "--log-level", "verbose", "serve"])
            .is_err());
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not-an-address").is_err());
    }
}
