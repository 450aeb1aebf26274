//! 信号滤波器
//!
//! 目前只有红外补光控制用到的一阶低通滤波器。

/// 一阶低通滤波器（指数平滑）
///
/// 离散形式：`x ← (1 - k) * x + k * v`，其中 `k = dt / (rc + dt)`。
///
/// # 参数
/// - `x0`: 初始值
/// - `rc`: 时间常数（秒）
/// - `dt`: 采样周期（秒）
#[derive(Debug, Clone)]
pub struct FirstOrderFilter {
    k: f64,
    x: f64,
}

impl FirstOrderFilter {
    /// 创建滤波器
    pub fn new(x0: f64, rc: f64, dt: f64) -> Self {
        Self {
            k: dt / (rc + dt),
            x: x0,
        }
    }

    /// 输入一个采样，返回滤波后的值
    pub fn update(&mut self, v: f64) -> f64 {
        self.x = (1.0 - self.k) * self.x + self.k * v;
        self.x
    }

    /// 当前滤波值（不更新）
    pub fn value(&self) -> f64 {
        self.x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_converges_to_constant_input() {
        let mut f = FirstOrderFilter::new(0.0, 30.0, 0.05);
        let mut last = 0.0;
        for _ in 0..10_000 {
            last = f.update(100.0);
        }
        assert!((last - 100.0).abs() < 1.0, "filter should converge: {last}");
    }

    #[test]
    fn test_filter_is_monotone_for_step_input() {
        // 阶跃输入下输出单调上升，且不超过输入
        let mut f = FirstOrderFilter::new(0.0, 30.0, 0.05);
        let mut prev = 0.0;
        for _ in 0..100 {
            let x = f.update(1600.0);
            assert!(x >= prev);
            assert!(x <= 1600.0);
            prev = x;
        }
    }

    #[test]
    fn test_filter_initial_value() {
        let f = FirstOrderFilter::new(42.0, 30.0, 0.05);
        assert_eq!(f.value(), 42.0);
    }
}
