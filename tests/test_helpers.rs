//! Test helpers for the healthcheck integration tests
//!
//! Wires a `HealthcheckService` to the in-memory repository and the
//! in-crate mocks, so the full admission and run lifecycle can be driven
//! without a metadata database or monitor system.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use das_healthcheck::healthcheck::mock::{
    engine_config_items, MockMetadataResolver, MockSourceFactory, MockSourceSet, MockSqlAdvisor,
};
use das_healthcheck::{HealthcheckMetrics, HealthcheckService, InMemoryHealthcheckRepository};
use std::sync::Arc;
use std::time::Duration;

pub const STEP: Duration = Duration::from_secs(60);

pub fn window() -> (DateTime<Utc>, DateTime<Utc>) {
    (
        Utc.with_ymd_and_hms(2021, 10, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2021, 10, 2, 0, 0, 0).unwrap(),
    )
}

/// Service plus handles on every double behind it
pub struct TestEnvironment {
    pub repository: Arc<InMemoryHealthcheckRepository>,
    pub factory: Arc<MockSourceFactory>,
    pub advisor: Arc<MockSqlAdvisor>,
    pub metrics: Arc<HealthcheckMetrics>,
    pub service: HealthcheckService,
}

impl TestEnvironment {
    /// Healthy target behind a generation 2 monitor
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestEnvironmentBuilder {
        TestEnvironmentBuilder::default()
    }

    pub fn sources(&self) -> &MockSourceSet {
        self.factory.sources()
    }
}

pub struct TestEnvironmentBuilder {
    system_type: i32,
    sources: MockSourceSet,
    failing_connect: bool,
}

impl Default for TestEnvironmentBuilder {
    fn default() -> Self {
        Self {
            system_type: 2,
            sources: MockSourceSet::healthy(),
            failing_connect: false,
        }
    }
}

impl TestEnvironmentBuilder {
    pub fn monitor_system_type(mut self, system_type: i32) -> Self {
        self.system_type = system_type;
        self
    }

    pub fn sources(mut self, sources: MockSourceSet) -> Self {
        self.sources = sources;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.failing_connect = true;
        self
    }

    pub fn build(self) -> TestEnvironment {
        let repository = Arc::new(InMemoryHealthcheckRepository::new(engine_config_items()));
        let metadata =
            Arc::new(MockMetadataResolver::new().with_monitor_system_type(self.system_type));
        let advisor = Arc::new(MockSqlAdvisor::new());
        let mut factory = MockSourceFactory::new(self.sources);
        if self.failing_connect {
            factory = factory.failing_connect();
        }
        let factory = Arc::new(factory);
        let metrics = Arc::new(HealthcheckMetrics::new().expect("metrics registry"));

        let service = HealthcheckService::new(
            repository.clone(),
            metadata,
            advisor.clone(),
            factory.clone(),
        )
        .with_metrics(metrics.clone());

        TestEnvironment {
            repository,
            factory,
            advisor,
            metrics,
            service,
        }
    }
}
