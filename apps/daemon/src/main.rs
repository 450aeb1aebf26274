//! panda 板卡守护进程主入口

mod singleton;

use std::process;
use std::sync::Arc;

use clap::Parser;
use panda_bridge::{
    MemParams, MessageHub, Platform, RuntimeConfig, Supervisor, UsbBoardProvider,
};
use singleton::SingletonLock;
use tracing_subscriber::EnvFilter;

/// panda 板卡守护进程
///
/// 独占板卡 USB 链路，把 CAN / GPS / 板卡状态转成发布订阅消息流。
/// 运行开关走环境变量：BOARDD_LOOPBACK / STARTED / FAKESEND / AUX_CAN_DRIVE。
#[derive(Parser, Debug)]
#[command(name = "panda_daemon")]
#[command(about = "panda board daemon - CAN/GPS pub-sub bridge", long_about = None)]
struct Args {
    /// 锁文件路径
    ///
    /// 默认: 自动选择用户可写目录（XDG_RUNTIME_DIR 或 /tmp）
    #[arg(long)]
    lock_file: Option<String>,
}

/// 获取默认锁文件路径
///
/// 优先使用用户可写的目录，避免权限问题：
/// 1. XDG_RUNTIME_DIR（Linux，通常为 /run/user/{uid}）
/// 2. 系统临时目录
fn get_default_lock_file() -> String {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        let path = runtime_dir.join("panda_daemon.lock");
        if let Some(parent) = path.parent() {
            if parent.exists() || std::fs::create_dir_all(parent).is_ok() {
                return path.to_string_lossy().to_string();
            }
        }
    }
    std::env::temp_dir()
        .join("panda_daemon.lock")
        .to_string_lossy()
        .to_string()
}

fn main() {
    let mut args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let lock_file = args.lock_file.take().unwrap_or_else(get_default_lock_file);

    // 1. 单例锁（确保只有一个守护进程实例）
    let _lock = match SingletonLock::try_lock(&lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("Failed to acquire singleton lock: {}", e);
            eprintln!("Another instance of panda_daemon may be running.");
            eprintln!("Lock file: {}", lock_file);
            process::exit(1);
        },
    };

    let platform = Platform::detect();
    let config = RuntimeConfig::from_env(platform);

    // 打印启动信息
    eprintln!("panda daemon starting...");
    eprintln!("  Platform: {:?}", platform);
    eprintln!("  Lock file: {}", lock_file);
    if config.loopback {
        eprintln!("  Loopback: enabled");
    }
    if config.fake_send {
        eprintln!("  Fake send: enabled");
    }
    if config.aux_can_drive {
        eprintln!("  Aux CAN drive: shifts swapped");
    }

    let hub = MessageHub::new();
    let params = Arc::new(MemParams::new());
    let supervisor = Supervisor::new(UsbBoardProvider::new(), hub, params, config);

    // 2. 信号处理（Ctrl+C 优雅退出）
    let sup_for_signal = Arc::clone(&supervisor);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal. Shutting down...");
        sup_for_signal.request_exit();
    }) {
        eprintln!("Failed to set signal handler: {}", e);
        process::exit(1);
    }

    // 3. 进入监督主循环（阻塞直到收到退出请求）
    eprintln!("panda daemon started. Press Ctrl+C to stop.");
    supervisor.run();
    eprintln!("panda daemon stopped.");
}
