use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct BackplaneMetrics {
    pub published: IntCounter,
    pub delivered: IntCounter,
    pub delivery_failures: IntCounter,
    pub acked: IntCounter,
    pub dispatch_failures: IntCounter,
    pub cleaned: IntCounter,
    pub active_subscribers: IntGauge,
}

impl BackplaneMetrics {
    pub fn new(service: &str) -> Self {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(
                Opts::new(name, help).const_label("service", service.to_string()),
            )
            .expect("valid metric opts for backplane counter")
        };

        let published = counter(
            "backplane_published_total",
            "Total number of envelopes appended to the backplane",
        );
        let delivered = counter(
            "backplane_delivered_total",
            "Total number of decoded messages written to local connections",
        );
        let delivery_failures = counter(
            "backplane_delivery_failures_total",
            "Total number of failed writes to local connections",
        );
        let acked = counter(
            "backplane_acked_total",
            "Total number of messages acknowledged by this process",
        );
        let dispatch_failures = counter(
            "backplane_dispatch_failures_total",
            "Total number of envelopes that could not be dispatched",
        );
        let cleaned = counter(
            "backplane_cleaned_total",
            "Total number of messages removed or flagged by the cleaner",
        );

        let active_subscribers = IntGauge::with_opts(
            Opts::new(
                "backplane_active_subscribers",
                "Number of subscribers seen within the heartbeat timeout",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for backplane_active_subscribers");

        let registry = prometheus::default_registry();
        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(delivered.clone()),
            Box::new(delivery_failures.clone()),
            Box::new(acked.clone()),
            Box::new(dispatch_failures.clone()),
            Box::new(cleaned.clone()),
            Box::new(active_subscribers.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register backplane metric: {}", e);
            }
        }

        Self {
            published,
            delivered,
            delivery_failures,
            acked,
            dispatch_failures,
            cleaned,
            active_subscribers,
        }
    }
}
