//! Prometheus 监控指标模块
//!
//! 提供全局指标收集和导出功能

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

static METRICS_INIT: Once = Once::new();

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// HTTP 请求延迟（秒）
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("keygate_http_request_duration_seconds", "HTTP request duration in seconds")
            .namespace("keygate")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["service", "method", "path", "status"]
    ).unwrap();

    /// HTTP 请求总数
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_http_requests_total", "Total number of HTTP requests")
            .namespace("keygate"),
        &["service", "method", "path", "status"]
    ).unwrap();

    /// 错误次数
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_errors_total", "Total number of errors")
            .namespace("keygate"),
        &["service", "error_type"]
    ).unwrap();
}

/// 注册所有通用指标到全局 Registry
///
/// This function is idempotent - calling it multiple times is safe.
/// Only the first call will actually register the metrics.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let mut result = Ok(());

    METRICS_INIT.call_once(|| {
        let register_result = (|| {
            REGISTRY.register(Box::new(REQUEST_DURATION.clone()))?;
            REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
            REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;
            Ok::<(), prometheus::Error>(())
        })();

        if let Err(e) = register_result {
            result = Err(e);
        }
    });

    result
}

/// HTTP 请求计时器
pub struct RequestTimer {
    start: Instant,
    service: String,
    method: String,
    path: String,
}

impl RequestTimer {
    /// 创建计时器
    pub fn new(service: &str, method: &str, path: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
            path: path.to_string(),
        }
    }

    /// 完成计时并记录指标
    pub fn observe(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        let status_str = status.to_string();

        REQUEST_DURATION
            .with_label_values(&[&self.service, &self.method, &self.path, &status_str])
            .observe(duration);

        REQUESTS_TOTAL
            .with_label_values(&[&self.service, &self.method, &self.path, &status_str])
            .inc();
    }
}

/// 导出 Prometheus 格式的指标
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        let result = register_metrics();
        assert!(result.is_ok());
        // Second call is a no-op
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_request_timer() {
        let _ = register_metrics();

        let before = REQUESTS_TOTAL
            .with_label_values(&["test-service", "GET", "/test", "200"])
            .get();

        let timer = RequestTimer::new("test-service", "GET", "/test");
        timer.observe(200);

        let after = REQUESTS_TOTAL
            .with_label_values(&["test-service", "GET", "/test", "200"])
            .get();

        assert!(after > before);
    }

    #[test]
    fn test_export_metrics() {
        let _ = register_metrics();

        REQUESTS_TOTAL
            .with_label_values(&["tks", "GET", "/genkey", "200"])
            .inc();

        let output = export_metrics();
        assert!(
            output.contains("keygate_http_requests_total"),
            "Output should contain request counter. Output: {output}"
        );
    }
}
