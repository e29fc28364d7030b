// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use container_monitor::{
    config::AgentConfig,
    dispatcher::EventDispatcher,
    error::MonitorError,
    forwarder::Forwarder,
    monitor::{Collaborators, Monitor},
    runtime::docker::DockerRuntime,
    sinks::{
        autoscaling::AutoScalingHealthSink,
        cloudwatch::CloudWatchLogSinkFactory,
        kinesis::KinesisStreamSink,
        reporting::{LoggingHealthSink, TracingErrorReporter},
        HealthSink,
    },
    state::MonitorState,
};

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid agent configuration: {e}");
            return;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,aws_smithy_runtime=warn,{}",
        config.log_level
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run(config).await {
        error!("agent at=end err={:?}", e.to_string());
        return;
    }

    info!("agent at=end");
}

async fn run(config: AgentConfig) -> Result<(), MonitorError> {
    let runtime = DockerRuntime::connect(config.docker_host.as_deref()).inspect_err(|e| {
        error!("docker ok=false count#DockerError=1 err={:?}", e.to_string());
    })?;

    let log_sinks = Arc::new(CloudWatchLogSinkFactory::from_env().await);
    let streams = Arc::new(KinesisStreamSink::from_env().await);
    let health: Arc<dyn HealthSink> = if config.development {
        Arc::new(LoggingHealthSink)
    } else {
        Arc::new(AutoScalingHealthSink::from_env().await)
    };

    info!(
        "agent at=start instance={} docker_host={} development={}",
        config.instance_id,
        config.docker_host.as_deref().unwrap_or("local"),
        config.development
    );

    let config = Arc::new(config);
    let state = Arc::new(MonitorState::new());

    let monitor = Monitor::new(
        Arc::clone(&config),
        Arc::clone(&state),
        Collaborators {
            runtime: Arc::new(runtime),
            log_sinks,
            reporter: Arc::new(TracingErrorReporter),
            health,
        },
    );

    let system_log = Arc::clone(&monitor);
    let forwarder = Forwarder::new(state, streams, config.flush_interval)
        .with_system_log(Arc::new(move |line: &str| system_log.log_system(line)));
    tokio::spawn(forwarder.run());

    EventDispatcher::new(monitor).run().await;
    Ok(())
}
