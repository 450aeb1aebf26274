//! 硬件控制环路
//!
//! 订阅 `deviceState` 和 `driverCameraState`，驱动三件事：
//! - 主机充电开关（USB 供电模式切换）
//! - 散热风扇转速
//! - 驾驶员监控摄像头的红外补光功率
//!
//! 风扇与红外只有 UNO / DOS 硬件才有。

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::board::{Board, BoardProvider, UsbPowerMode};
use crate::filters::FirstOrderFilter;
use crate::messaging::{Payload, SubMaster};
use crate::supervisor::Supervisor;
use crate::timeutil::nanos_since_boot;

/// 红外功率上下限（占空比）
const MAX_IR_POWER: f64 = 0.5;
const MIN_IR_POWER: f64 = 0.0;
/// 曝光积分行数的插值区间
const CUTOFF_IL: i32 = 200;
const SATURATE_IL: i32 = 1600;

/// 按曝光积分行数计算红外功率百分比
///
/// 区间内线性插值；越暗（积分行数越多）补光越强。
fn ir_power_percent(integ_lines: i32) -> u16 {
    let power = if integ_lines <= CUTOFF_IL {
        MIN_IR_POWER
    } else if integ_lines > SATURATE_IL {
        MAX_IR_POWER
    } else {
        MIN_IR_POWER
            + f64::from(integ_lines - CUTOFF_IL) * (MAX_IR_POWER - MIN_IR_POWER)
                / f64::from(SATURATE_IL - CUTOFF_IL)
    };
    (100.0 * power) as u16
}

pub(crate) fn hardware_control_loop<P>(sup: &Arc<Supervisor<P>>)
where
    P: BoardProvider + 'static,
{
    let mut sm = SubMaster::new(&sup.hub, &["deviceState", "driverCameraState"]);

    let mut last_front_frame_t: u64 = 0;
    let mut prev_fan_speed: u16 = 999;
    let mut ir_pwr: u16 = 0;
    let mut prev_ir_pwr: u16 = 999;
    let mut prev_charging_disabled = false;
    let mut cnt: u64 = 0;

    // TICI 的摄像头曝光抖动大，先做一阶平滑
    let mut integ_lines_filter = FirstOrderFilter::new(0.0, 30.0, 0.05);

    while sup.workers_alive() {
        cnt += 1;
        sm.update(Duration::from_secs(1));

        let Some(main) = sup.main_board() else {
            break;
        };

        if !sup.config.platform.is_pc() && sm.updated("deviceState") {
            if let Some(Payload::DeviceState(ds)) = sm.get("deviceState").map(|m| &m.payload) {
                if ds.charging_disabled != prev_charging_disabled {
                    let mode = if ds.charging_disabled {
                        info!("turning off charging");
                        UsbPowerMode::Client
                    } else {
                        info!("turning on charging");
                        UsbPowerMode::Cdp
                    };
                    if let Err(e) = main.set_usb_power_mode(mode) {
                        warn!("set_usb_power_mode failed: {e}");
                    }
                    prev_charging_disabled = ds.charging_disabled;
                }
            }
        }

        // 其他硬件没有风扇/红外可控
        if !main.hw_type().has_fan_and_ir() {
            continue;
        }

        if sm.updated("deviceState") {
            if let Some(Payload::DeviceState(ds)) = sm.get("deviceState").map(|m| &m.payload) {
                let fan_speed = ds.fan_speed_percent_desired;
                if fan_speed != prev_fan_speed || cnt % 100 == 0 {
                    if let Err(e) = main.set_fan_speed(fan_speed) {
                        warn!("set_fan_speed failed: {e}");
                    }
                    prev_fan_speed = fan_speed;
                }
            }
        }

        if sm.updated("driverCameraState") {
            if let Some(msg) = sm.get("driverCameraState") {
                if let Payload::DriverCameraState(cs) = &msg.payload {
                    let mut cur_integ_lines = cs.integ_lines;
                    if sup.config.platform.is_tici() {
                        cur_integ_lines =
                            integ_lines_filter.update(f64::from(cur_integ_lines)) as i32;
                    }
                    last_front_frame_t = msg.log_mono_time;
                    ir_pwr = ir_power_percent(cur_integ_lines);
                }
            }
        }

        // 摄像头掉流超过 1 秒就关补光
        if nanos_since_boot().saturating_sub(last_front_frame_t) > 1_000_000_000 {
            ir_pwr = 0;
        }

        if ir_pwr != prev_ir_pwr || cnt % 100 == 0 || ir_pwr >= 50 {
            if let Err(e) = main.set_ir_pwr(ir_pwr) {
                warn!("set_ir_pwr failed: {e}");
            }
            prev_ir_pwr = ir_pwr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_power_boundaries() {
        assert_eq!(ir_power_percent(200), 0);
        assert_eq!(ir_power_percent(1600), 50);
        assert_eq!(ir_power_percent(900), 25);
    }

    #[test]
    fn test_ir_power_clamps() {
        assert_eq!(ir_power_percent(-50), 0);
        assert_eq!(ir_power_percent(0), 0);
        assert_eq!(ir_power_percent(100_000), 50);
    }

    #[test]
    fn test_ir_power_monotone_in_between() {
        let mut prev = 0;
        for lines in (CUTOFF_IL..=SATURATE_IL).step_by(50) {
            let p = ir_power_percent(lines);
            assert!(p >= prev, "IR power must be monotone: {lines} -> {p}");
            prev = p;
        }
    }
}
