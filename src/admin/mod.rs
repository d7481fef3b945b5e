use std::fmt::Write;
use std::time::Duration;

use crate::classifier::ErrorInfo;
use crate::config::GatewayConfig;
use crate::gateway::PoolStats;
use crate::pacing::PaceStats;

// -----------------------------------------------------------------------------
// ----- Formatting ------------------------------------------------------------

pub fn format_error_info(info: &ErrorInfo) -> String {
    format!(
        "code={}\nmessage={}\ncategory={}\nretryable={}\nfatal={}\nsuggested_wait={}",
        info.code,
        info.message,
        info.category,
        info.retryable,
        info.fatal,
        secs(info.suggested_wait)
    )
}

pub fn format_pace_stats(stats: &PaceStats) -> String {
    format!(
        "calls_in_window={}\nheavy_weight_in_window={}\ntracked_resources={}\nrecorded_calls={}\ndelayed_calls={}\ntotal_wait={}",
        stats.calls_in_window,
        stats.heavy_weight_in_window,
        stats.tracked_resources,
        stats.recorded_calls,
        stats.delayed_calls,
        secs(stats.total_wait)
    )
}

pub fn format_pool_stats(stats: &PoolStats) -> String {
    let mut out = format!(
        "endpoint={}\nconnections={}/{}\npending={}\nretiring={}\ncreated={}\nevicted={}\ncreation_failures={}\nidentity_conflicts={}\nsleep_wake_recoveries={}",
        stats.endpoint,
        stats.current,
        stats.max,
        stats.pending,
        stats.retiring,
        stats.created,
        stats.evicted,
        stats.creation_failures,
        stats.identity_conflicts,
        stats.sleep_wake_recoveries
    );

    for h in &stats.handles {
        let _ = write!(
            out,
            "\nconnection.{}=state:{} processed:{} errored:{} queued:{} idle:{} uptime:{}",
            h.identity,
            h.state.as_str(),
            h.processed,
            h.errored,
            h.queued,
            secs(h.idle_for),
            secs(h.uptime)
        );
    }

    out
}

pub fn format_config(cfg: &GatewayConfig) -> String {
    let pool = &cfg.pool;
    let conn = &pool.handle;
    let pacing = &cfg.pacing;

    let mut out = format!(
        "endpoint={}\nclient_ids={}..{}\nmax_connections={}\nmin_connections={}\nacquire_timeout={}\nidentity_retry_attempts={}\nidentity_retry_backoff={}\npool_sleep_wake_gap={}",
        pool.endpoint,
        pool.identity_base,
        pool.identity_base.saturating_add(pool.identity_span),
        pool.max_connections,
        pool.min_connections,
        secs(pool.acquire_timeout),
        pool.identity_retry_attempts,
        secs(pool.identity_retry_backoff),
        secs(pool.sleep_wake_gap)
    );

    let _ = write!(
        out,
        "\nidle_timeout={}\nrequest_timeout={}\nconnect_timeout={}\nprobe_timeout={}\nqueue_capacity={}\npoll_interval={}\nsleep_wake_gap={}",
        secs(conn.idle_timeout),
        secs(conn.request_timeout),
        secs(conn.connect_timeout),
        secs(conn.probe_timeout),
        conn.queue_capacity,
        secs(conn.poll_interval),
        secs(conn.sleep_wake_gap)
    );

    let _ = write!(
        out,
        "\nhealth_check_interval={}\nshutdown_grace={}",
        secs(cfg.health_check_interval),
        secs(cfg.shutdown_grace)
    );

    let _ = write!(
        out,
        "\npacing.global={}/{}\npacing.heavy_min_spacing={}\npacing.rolling={}/{}\npacing.per_resource={}/{}\npacing.duplicate_cooldown={}",
        pacing.max_calls_per_window,
        secs(pacing.global_window),
        secs(pacing.heavy_min_spacing),
        pacing.rolling_max_weight,
        secs(pacing.rolling_window),
        pacing.resource_max_calls,
        secs(pacing.resource_window),
        secs(pacing.duplicate_cooldown)
    );

    for (code, rule) in &cfg.error_codes {
        let _ = write!(
            out,
            "\nerror_code.{code}={} wait:{}",
            rule.category,
            secs(rule.wait)
        );
    }

    out
}

fn secs(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorCategory, ErrorClassifier};

    #[test]
    fn error_info_lines() {
        let info = ErrorClassifier::new().format_error_info(420, "pacing violation");
        let out = format_error_info(&info);

        assert_eq!(
            out,
            "code=420\nmessage=pacing violation\ncategory=pacing_violation\nretryable=true\nfatal=false\nsuggested_wait=60.000s"
        );
        assert_eq!(info.category, ErrorCategory::PacingViolation);
    }

    #[test]
    fn pace_stats_lines() {
        let stats = PaceStats {
            calls_in_window: 3,
            heavy_weight_in_window: 2,
            tracked_resources: 1,
            recorded_calls: 10,
            delayed_calls: 4,
            total_wait: Duration::from_millis(2500),
        };

        let out = format_pace_stats(&stats);
        assert!(out.contains("calls_in_window=3\n"));
        assert!(out.contains("delayed_calls=4\n"));
        assert!(out.ends_with("total_wait=2.500s"));
    }

    #[test]
    fn config_lines_include_error_codes() {
        let cfg = GatewayConfig::parse(
            "[[error_codes]]\ncode = 2105\ncategory = \"connection_error\"\nwait = \"10s\"",
        )
        .unwrap();

        let out = format_config(&cfg);
        assert!(out.starts_with("endpoint=127.0.0.1:4002\nclient_ids=1..33\n"));
        assert!(out.contains("\nidle_timeout=180.000s\n"));
        assert!(out.contains("\npacing.rolling=60/600.000s\n"));
        assert!(out.ends_with("error_code.2105=connection_error wait:10.000s"));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
