//! 连接监督：发现、打开、分槽
//!
//! 只在主线程、没有工作线程运行的窗口里执行，因此可以直接写槽位。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::board::protocol::fw_signature_hex;
use crate::board::{Board, BoardError, BoardProvider, UsbPowerMode};
use crate::params;
use crate::supervisor::Supervisor;
use crate::timeutil::wall_time_valid;

/// 发现轮询周期
const DISCOVERY_POLL: Duration = Duration::from_millis(100);

impl<P> Supervisor<P>
where
    P: BoardProvider + 'static,
{
    /// 发现并打开全部板卡，直到 main 槽位就绪
    ///
    /// # 返回
    /// - `true`: main 已就绪，可以起工作线程
    /// - `false`: 期间收到了退出请求
    pub(crate) fn connect_boards(&self) -> bool {
        while !self.exit_requested() {
            info!("attempting to find boards");

            // 轮询发现，直到至少一块板卡在线
            loop {
                if self.exit_requested() {
                    return false;
                }
                thread::sleep(DISCOVERY_POLL);
                match self.provider.list() {
                    Ok(serials) if !serials.is_empty() => {
                        for (i, serial) in serials.iter().enumerate() {
                            info!("board #{i} USB serial: {serial}");
                        }
                        info!("total boards detected: {}", serials.len());
                        *self.detected.lock() = serials;
                        break;
                    },
                    Ok(_) => {},
                    Err(e) => warn!("board discovery failed: {e}"),
                }
            }

            // 逐个打开，直到发现的板卡全部建立会话（或被丢弃）
            while !self.exit_requested() {
                if self.detected.lock().is_empty() {
                    break;
                }
                if let Err(e) = self.connect_one() {
                    warn!("board open failed: {e}");
                }
                thread::sleep(DISCOVERY_POLL);
            }

            if let Some(board) = self.main_board() {
                info!("connected to main board: {}", board.usb_serial());
                if let Some(aux) = self.aux_board() {
                    info!("connected to aux board: {}", aux.usb_serial());
                }
                return !self.exit_requested();
            }

            // 一块 main 候选都没有落位：清空半成品，重新发现
            warn!("no main board after connect pass, restarting discovery");
            self.main.store(None);
            self.aux.store(None);
            self.connected.lock().clear();
        }
        false
    }

    /// 打开 `detected` 队首的板卡并装入槽位
    ///
    /// 任何一步失败都丢弃这块板卡（会话随之关闭），下个周期重试。
    fn connect_one(&self) -> Result<(), BoardError> {
        let serial = {
            let mut detected = self.detected.lock();
            if detected.is_empty() {
                return Ok(());
            }
            detected.remove(0)
        };

        let board = match self.provider.open(&serial) {
            Ok(board) => board,
            Err(e) => {
                // 打开失败的板卡放回队尾，等下个发现周期
                self.detected.lock().push(serial);
                return Err(e);
            },
        };

        if self.config.loopback {
            board.set_loopback(true)?;
        }

        // 固件指纹与序列号发布到参数仓库；读不出来的板卡不可信，丢弃
        let fw_sig = board.get_firmware_version()?;
        self.params.put(params::PANDA_FIRMWARE, &fw_sig);
        let fw_hex = fw_signature_hex(&fw_sig);
        self.params.put(params::PANDA_FIRMWARE_HEX, fw_hex.as_bytes());
        info!("fw signature: {fw_hex}");

        let dongle_id = board.get_serial()?;
        self.params.put(params::PANDA_DONGLE_ID, dongle_id.as_bytes());
        info!("board serial: {dongle_id}");

        // 首次连接才下发充电模式：板卡切模式会短暂掉线，不能每次都来
        if !self.connected_once.load(Ordering::SeqCst) && !self.config.platform.is_pc() {
            board.set_usb_power_mode(UsbPowerMode::Cdp)?;
        }

        if board.has_rtc() {
            self.sync_host_clock_from_rtc(&board);
        }

        self.connected_once.store(true, Ordering::SeqCst);
        self.connected.lock().push(serial);

        if board.hw_type().is_main_candidate() {
            self.main.store(Some(Arc::new(board)));
        } else {
            self.aux.store(Some(Arc::new(board)));
        }
        Ok(())
    }

    /// 主机时钟无效而板载 RTC 有效时，用 RTC 校准主机时钟
    fn sync_host_clock_from_rtc(&self, board: &P::Board) {
        let rtc = match board.get_rtc() {
            Ok(rtc) => rtc,
            Err(e) => {
                warn!("RTC read failed: {e}");
                return;
            },
        };

        let host = OffsetDateTime::now_utc();
        if wall_time_valid(&host) || !rtc.valid() {
            return;
        }
        let Some(rtc_dt) = rtc.to_datetime() else {
            return;
        };

        error!("host clock invalid, setting from board RTC. host: {host} rtc: {rtc_dt}");
        let spec = nix::sys::time::TimeSpec::new(rtc_dt.unix_timestamp(), 0);
        if let Err(e) = nix::time::clock_settime(nix::time::ClockId::CLOCK_REALTIME, spec) {
            warn!("clock_settime failed: {e}");
        }
    }
}
