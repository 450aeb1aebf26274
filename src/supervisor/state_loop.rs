//! 板卡状态环路
//!
//! 2Hz 驱动整个板级状态机：健康轮询、点火推导、省电与安全模型迁移、
//! RTC 回写、`pandaState` 发布和心跳。点火沿在这里产生，安全设定任务
//! 也从这里拉起。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::board::{Board, BoardProvider, HealthSnapshot, HwType, RtcTime, SafetyModel};
use crate::hardware;
use crate::messaging::{PandaStateMsg, Payload, PubMaster};
use crate::params::ClearTag;
use crate::supervisor::{Supervisor, safety_setter};
use crate::timeutil::{millis_since_boot, wall_time_valid};

/// 轮询周期：500ms = 2Hz
const TICK: Duration = Duration::from_millis(500);

/// RTC 回写的最小偏差（秒）
const RTC_MAX_DRIFT_S: f64 = 1.1;

/// sysfs 读数耗时告警阈值（毫秒）
const SYSFS_READ_WARN_MS: f64 = 50.0;

pub(crate) fn board_state_loop<P>(sup: &Arc<Supervisor<P>>)
where
    P: BoardProvider + 'static,
{
    let pm = PubMaster::new(Arc::clone(&sup.hub), &["pandaState"]);

    // 未连接期间的保活报文：只带 Unknown 型号
    while !sup.exit_requested() && sup.main_board().is_none() {
        pm.send(
            "pandaState",
            Payload::PandaState(PandaStateMsg {
                panda_type: HwType::Unknown,
                ..Default::default()
            }),
        );
        thread::sleep(TICK);
    }

    let mut no_ignition_cnt: u32 = 0;
    let mut ignition_last = false;

    while sup.workers_alive() {
        let Some(main) = sup.main_board() else {
            break;
        };
        tick(sup, &pm, &main, &mut no_ignition_cnt, &mut ignition_last);
        thread::sleep(TICK);
    }
}

fn tick<P>(
    sup: &Arc<Supervisor<P>>,
    pm: &PubMaster,
    main: &Arc<P::Board>,
    no_ignition_cnt: &mut u32,
    ignition_last: &mut bool,
) where
    P: BoardProvider + 'static,
{
    let mut health = match main.get_state() {
        Ok(health) => health,
        Err(e) => {
            warn!("main health poll failed: {e}");
            return;
        },
    };

    if sup.config.spoof_started {
        health.ignition_line = 1;
    }

    // Silent 模型不保持 CAN 外设唤醒，安静总线上安全设定握手会卡死，
    // 观察到就立刻压回 NoOutput
    if health.safety_model == SafetyModel::Silent {
        command_safety(main.as_ref(), SafetyModel::NoOutput, 0);
    }

    let aux = sup.aux_board();
    let mut aux_health = None;
    if let Some(aux) = &aux {
        match aux.get_state() {
            Ok(h) => {
                if h.safety_model == SafetyModel::Silent {
                    command_safety(aux.as_ref(), SafetyModel::NoOutput, 0);
                }
                if !sup.ignition() && health.safety_model != SafetyModel::NoOutput {
                    command_safety(aux.as_ref(), SafetyModel::NoOutput, 0);
                }
                aux_health = Some(h);
            },
            Err(e) => warn!("aux health poll failed: {e}"),
        }
    }

    // 点火来自逻辑主总线（偏移为 0 的那块板）
    let ignition_src = if sup.config.main_shift() == 0 {
        &health
    } else {
        aux_health.as_ref().unwrap_or(&health)
    };
    let ignition = ignition_src.ignition_line != 0 || ignition_src.ignition_can != 0;
    sup.set_ignition(ignition);

    if ignition {
        *no_ignition_cnt = 0;
    } else {
        *no_ignition_cnt += 1;
    }

    // 省电状态跟随点火
    let power_save_desired = !ignition;
    if health.power_save_enabled != power_save_desired {
        command_power_save(main.as_ref(), power_save_desired);
        if let Some(aux) = &aux {
            command_power_save(aux.as_ref(), power_save_desired);
        }
    }

    // 驻车即 NoOutput
    if !ignition && health.safety_model != SafetyModel::NoOutput {
        command_safety(main.as_ref(), SafetyModel::NoOutput, 0);
    }

    // 点火沿：清参数、拉起安全设定任务
    if ignition && !*ignition_last {
        sup.params.clear_all(ClearTag::OnIgnitionOn);

        if !sup.safety_setter_running.swap(true, Ordering::SeqCst) {
            let sup = Arc::clone(sup);
            thread::spawn(move || safety_setter::safety_setter(&sup));
        } else {
            warn!("safety setter already running");
        }
    } else if !ignition && *ignition_last {
        sup.params.clear_all(ClearTag::OnIgnitionOff);
    }

    // 驻车时每分钟校一次板载 RTC
    if main.has_rtc() && !ignition && *no_ignition_cnt % 120 == 1 {
        write_back_rtc(main.as_ref());
    }

    *ignition_last = ignition;

    let fan_speed_rpm = main.get_fan_speed().unwrap_or_else(|e| {
        warn!("fan speed read failed: {e}");
        0
    });

    pm.send(
        "pandaState",
        Payload::PandaState(build_state_msg(sup, main.as_ref(), &health, ignition, fan_speed_rpm)),
    );

    if let Err(e) = main.send_heartbeat() {
        warn!("main heartbeat failed: {e}");
    }
    if let Some(aux) = &aux {
        if let Err(e) = aux.send_heartbeat() {
            warn!("aux heartbeat failed: {e}");
        }
    }
}

fn command_safety<B: Board + ?Sized>(board: &B, model: SafetyModel, param: i16) {
    if let Err(e) = board.set_safety_model(model, param) {
        warn!("set_safety_model({model:?}) failed: {e}");
    }
}

fn command_power_save<B: Board + ?Sized>(board: &B, enable: bool) {
    if let Err(e) = board.set_power_saving(enable) {
        warn!("set_power_saving({enable}) failed: {e}");
    }
}

/// 主机时间可信且与板载 RTC 偏差超限时回写
fn write_back_rtc<B: Board + ?Sized>(board: &B) {
    let host = OffsetDateTime::now_utc();
    if !wall_time_valid(&host) {
        return;
    }
    let rtc = match board.get_rtc() {
        Ok(rtc) => rtc,
        Err(e) => {
            warn!("RTC read failed: {e}");
            return;
        },
    };
    let drift_s = match rtc.to_datetime() {
        Some(rtc_dt) => (rtc_dt - host).as_seconds_f64(),
        // RTC 读数不可解析时视为无限漂移
        None => f64::INFINITY,
    };
    if drift_s.abs() > RTC_MAX_DRIFT_S {
        info!("updating board RTC, dt = {drift_s:.2}s, host: {host}");
        if let Err(e) = board.set_rtc(RtcTime::from_datetime(&host)) {
            warn!("RTC write failed: {e}");
        }
    }
}

fn build_state_msg<P>(
    sup: &Arc<Supervisor<P>>,
    main: &P::Board,
    health: &HealthSnapshot,
    ignition: bool,
    fan_speed_rpm: u16,
) -> PandaStateMsg
where
    P: BoardProvider + 'static,
{
    // TICI 上电压电流以主机侧 hwmon 为准
    let (voltage, current) = if sup.config.platform.is_tici() {
        let read_start = millis_since_boot();
        let voltage = hardware::read_sysfs_u32(hardware::HWMON_VOLTAGE_PATH);
        let current = hardware::read_sysfs_u32(hardware::HWMON_CURRENT_PATH);
        let read_time = millis_since_boot() - read_start;
        if read_time > SYSFS_READ_WARN_MS {
            warn!("reading hwmon took {read_time:.1}ms");
        }
        (
            voltage.unwrap_or(health.voltage),
            current.unwrap_or(health.current),
        )
    } else {
        (health.voltage, health.current)
    };

    PandaStateMsg {
        valid: main.comms_healthy(),
        uptime: health.uptime,
        voltage,
        current,
        ignition_line: ignition,
        ignition_can: health.ignition_can != 0,
        controls_allowed: health.controls_allowed,
        gas_interceptor_detected: health.gas_interceptor_detected,
        has_gps: true,
        can_rx_errs: health.can_rx_errs,
        can_send_errs: health.can_send_errs,
        can_fwd_errs: health.can_fwd_errs,
        gmlan_send_errs: health.gmlan_send_errs,
        panda_type: main.hw_type(),
        usb_power_mode: health.usb_power_mode,
        safety_model: health.safety_model,
        safety_param: health.safety_param,
        fan_speed_rpm,
        fault_status: health.fault_status,
        power_save_enabled: health.power_save_enabled,
        heartbeat_lost: health.heartbeat_lost,
        harness_status: health.harness_status,
        faults: health.active_faults(),
    }
}
