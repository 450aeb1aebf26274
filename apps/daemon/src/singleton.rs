//! 守护进程单例锁
//!
//! 两个实例同时抢一条 USB 链路只会互相拆台，用文件排他锁保证单例。
//! 锁随进程退出自动释放（包括异常退出），不需要清理陈旧的 pid 文件。

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use fs4::fs_std::FileExt;

/// 持有期间代表本进程是唯一实例
pub struct SingletonLock {
    _file: File,
}

impl SingletonLock {
    /// 尝试获取排他锁
    ///
    /// # 返回
    /// - `Ok(lock)`: 拿到锁，持有它直到进程退出
    /// - `Err(e)`: 已有实例在运行，或锁文件不可写
    pub fn try_lock(path: &str) -> io::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock is held by another process",
            ));
        }

        // pid 只是给人看的，锁语义完全由 flock 承担
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { _file: file })
    }
}
