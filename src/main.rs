use anyhow::{bail, Context, Result};
use drive_uploader::{
    config::AppConfig,
    logging,
    uploader::{folder::format_bytes, ScanOptions, UploadEvent},
    FolderScanner, UploadManager, UploadTaskStatus,
};
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

fn usage() -> String {
    "用法: drive-uploader <远端目录> <本地路径>...".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(target_dir) = args.next() else {
        bail!(usage());
    };
    let paths: Vec<String> = args.collect();
    if paths.is_empty() {
        bail!(usage());
    }

    let config_path =
        std::env::var("DRIVE_UPLOADER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load_or_default(&config_path).await;

    // 日志守卫必须存活到进程结束
    let _log_guard = logging::init_logging(&config.log);
    info!("配置加载完成: {}", config_path);

    let scanner = FolderScanner::with_options(ScanOptions {
        ignored_names: config.upload.ignored_file_names.clone(),
        ..ScanOptions::default()
    });
    let items = scanner.expand(&paths).context("展开上传路径失败")?;
    if items.is_empty() {
        warn!("没有需要上传的文件");
        return Ok(());
    }

    let total: u64 = items.iter().map(|i| i.source.size).sum();
    info!(
        "准备上传 {} 个文件 ({}) 到 {}",
        items.len(),
        format_bytes(total),
        target_dir
    );

    let manager = UploadManager::from_config(&config)?;

    let mut events = manager.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                UploadEvent::StatusChanged {
                    task_id,
                    new_status,
                    error,
                    ..
                } => match error {
                    Some(e) => warn!("任务 {} -> {:?}: {}", task_id, new_status, e),
                    None => info!("任务 {} -> {:?}", task_id, new_status),
                },
                UploadEvent::Drained {
                    succeeded, failed, ..
                } => {
                    info!("队列已清空: 成功 {}, 失败 {}", succeeded, failed);
                }
                _ => {}
            }
        }
    });

    manager.add_uploads(&target_dir, items);
    manager.wait_idle().await;
    reporter.abort();

    let snapshot = manager.snapshot();
    let mut failed = 0;
    for task in &snapshot {
        match task.status {
            UploadTaskStatus::Success => {}
            UploadTaskStatus::Conflict => {
                failed += 1;
                warn!("目标已存在: {}", task.logical_path);
            }
            _ => {
                failed += 1;
                warn!(
                    "上传失败: {} ({})",
                    task.logical_path,
                    task.error.as_deref().unwrap_or("未知错误")
                );
            }
        }
    }

    info!(
        "上传结束: 共 {} 个, 成功 {}, 失败 {}",
        snapshot.len(),
        snapshot.len() - failed,
        failed
    );

    if failed > 0 {
        bail!("{} 个文件未能上传", failed);
    }
    Ok(())
}
