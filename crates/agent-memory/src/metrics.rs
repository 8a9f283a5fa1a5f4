use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct Collectors {
    sessions: IntCounterVec,
    events: IntCounter,
    handoffs: IntCounterVec,
    handoff_conflicts: IntCounter,
    observations: IntCounter,
    searches: IntCounterVec,
    source_failures: IntCounterVec,
    summary_jobs: IntCounterVec,
    embedding_failures: IntCounter,
}

/// `None` when building the collectors failed; counting is then a no-op.
static COLLECTORS: OnceLock<Option<Collectors>> = OnceLock::new();

/// Register all collectors. Safe to call more than once, from any thread.
pub fn init_metrics() {
    COLLECTORS.get_or_init(|| match build_collectors() {
        Ok(collectors) => Some(collectors),
        Err(e) => {
            warn!("Failed to initialize metrics: {}", e);
            None
        }
    });
}

fn build_collectors() -> prometheus::Result<Collectors> {
    let collectors = Collectors {
        sessions: IntCounterVec::new(
            prometheus::opts!("agent_memory_sessions_total", "Session lifecycle changes"),
            &["event"],
        )?,
        events: IntCounter::new("agent_memory_session_events_total", "Events appended to sessions")?,
        handoffs: IntCounterVec::new(
            prometheus::opts!("agent_memory_handoff_transitions_total", "Handoff status transitions"),
            &["status"],
        )?,
        handoff_conflicts: IntCounter::new(
            "agent_memory_handoff_conflicts_total",
            "Handoff transitions rejected as illegal or lost races",
        )?,
        observations: IntCounter::new("agent_memory_pattern_observations_total", "Recorded pattern observations")?,
        searches: IntCounterVec::new(
            prometheus::opts!("agent_memory_searches_total", "Semantic searches served"),
            &["kind"],
        )?,
        source_failures: IntCounterVec::new(
            prometheus::opts!("agent_memory_search_source_failures_total", "Search sources that failed or timed out"),
            &["source"],
        )?,
        summary_jobs: IntCounterVec::new(
            prometheus::opts!("agent_memory_summarization_jobs_total", "Background summarization outcomes"),
            &["outcome"],
        )?,
        embedding_failures: IntCounter::new(
            "agent_memory_embedding_failures_total",
            "Embedding calls that failed or timed out",
        )?,
    };

    REGISTRY.register(Box::new(collectors.sessions.clone()))?;
    REGISTRY.register(Box::new(collectors.events.clone()))?;
    REGISTRY.register(Box::new(collectors.handoffs.clone()))?;
    REGISTRY.register(Box::new(collectors.handoff_conflicts.clone()))?;
    REGISTRY.register(Box::new(collectors.observations.clone()))?;
    REGISTRY.register(Box::new(collectors.searches.clone()))?;
    REGISTRY.register(Box::new(collectors.source_failures.clone()))?;
    REGISTRY.register(Box::new(collectors.summary_jobs.clone()))?;
    REGISTRY.register(Box::new(collectors.embedding_failures.clone()))?;
    Ok(collectors)
}

fn collectors() -> Option<&'static Collectors> {
    COLLECTORS.get().and_then(Option::as_ref)
}

pub fn inc_session(event: &str) {
    if let Some(c) = collectors() {
        c.sessions.with_label_values(&[event]).inc();
    }
}

pub fn inc_event() {
    if let Some(c) = collectors() {
        c.events.inc();
    }
}

pub fn inc_handoff(status: &str) {
    if let Some(c) = collectors() {
        c.handoffs.with_label_values(&[status]).inc();
    }
}

pub fn inc_handoff_conflict() {
    if let Some(c) = collectors() {
        c.handoff_conflicts.inc();
    }
}

pub fn inc_observation() {
    if let Some(c) = collectors() {
        c.observations.inc();
    }
}

pub fn inc_search(kind: &str) {
    if let Some(c) = collectors() {
        c.searches.with_label_values(&[kind]).inc();
    }
}

pub fn inc_source_failure(source: &str) {
    if let Some(c) = collectors() {
        c.source_failures.with_label_values(&[source]).inc();
    }
}

pub fn inc_summary_job(outcome: &str) {
    if let Some(c) = collectors() {
        c.summary_jobs.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_embedding_failure() {
    if let Some(c) = collectors() {
        c.embedding_failures.inc();
    }
}

/// Prometheus text exposition of everything registered.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        init_metrics();
        init_metrics();
        inc_session("started");
        inc_source_failure("pattern");
        let text = render();
        assert!(text.contains("agent_memory_sessions_total"));
        assert!(text.contains("source=\"pattern\""));
    }

    #[test]
    fn test_concurrent_init_registers_the_counted_collectors() {
        let threads: Vec<_> = (0..8).map(|_| std::thread::spawn(init_metrics)).collect();
        for t in threads {
            t.join().unwrap();
        }
        inc_source_failure("concurrent-init");
        assert!(render().contains("agent_memory_search_source_failures_total{source=\"concurrent-init\"} 1"));
    }
}
