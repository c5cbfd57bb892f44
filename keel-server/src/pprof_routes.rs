//! CPU profiling endpoints served under `/debug/pprof`.
//!
//! `profile` returns a gzipped pprof protobuf suitable for `go tool pprof`
//! or polarsignals; `flamegraph` returns a gzipped SVG for quick looks.
//!
//! Examples:
//!   curl -sSL "http://HOST:PORT/debug/pprof/profile?seconds=10&frequency=200" > profile.pb.gz
//!   curl -sSL "http://HOST:PORT/debug/pprof/flamegraph?seconds=10" > flamegraph.svg.gz

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::flamegraph::Options;
use pprof::protos::Message;
use pprof::ProfilerGuardBuilder;
use serde::Deserialize;
use tokio::time::sleep;

const DEFAULT_SECONDS: u64 = 10;
const DEFAULT_FREQUENCY: i32 = 200;
const DEFAULT_IMAGE_WIDTH: usize = 2500;

#[derive(Deserialize)]
pub(crate) struct ProfileQueryParams {
    /// Seconds to sample before taking the snapshot.
    pub seconds: Option<u64>,
    /// Sample frequency in Hz.
    pub frequency: Option<i32>,
    /// Flamegraph SVG width in pixels.
    pub image_width: Option<usize>,
}

pub(crate) async fn handle_index() -> &'static str {
    "/debug/pprof/\n\
     /debug/pprof/profile?seconds=10&frequency=200\n\
     /debug/pprof/flamegraph?seconds=10&frequency=200&image_width=2500\n"
}

pub(crate) async fn handle_profile(
    Query(params): Query<ProfileQueryParams>,
) -> Result<Response, Response> {
    let seconds = params.seconds.unwrap_or(DEFAULT_SECONDS);
    let frequency = params.frequency.unwrap_or(DEFAULT_FREQUENCY);

    match generate_report(frequency, seconds).await {
        Ok(body) => Ok((
            StatusCode::OK,
            [("Content-Type", "application/octet-stream")],
            body,
        )
            .into_response()),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain")],
            err.to_string(),
        )
            .into_response()),
    }
}

pub(crate) async fn handle_flamegraph(
    Query(params): Query<ProfileQueryParams>,
) -> Result<Response, Response> {
    let seconds = params.seconds.unwrap_or(DEFAULT_SECONDS);
    let frequency = params.frequency.unwrap_or(DEFAULT_FREQUENCY);
    let image_width = params.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH);

    match generate_flamegraph(frequency, seconds, image_width).await {
        Ok(body) => Ok((
            StatusCode::OK,
            [("Content-Type", "application/octet-stream")],
            body,
        )
            .into_response()),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain")],
            err.to_string(),
        )
            .into_response()),
    }
}

async fn generate_report(frequency: i32, seconds: u64) -> Result<Vec<u8>> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to build profiler guard")?;

    sleep(Duration::from_secs(seconds)).await;

    let profile = guard
        .report()
        .build()
        .context("Failed to build profiler report")?
        .pprof()
        .context("Failed to build pprof profile")?;

    let mut body = Vec::new();
    let mut encoder = GzEncoder::new(&mut body, Compression::default());
    profile
        .write_to_writer(&mut encoder)
        .context("Failed to write profile")?;
    encoder.finish().context("Failed to finish encoding profile")?;
    Ok(body)
}

async fn generate_flamegraph(frequency: i32, seconds: u64, image_width: usize) -> Result<Vec<u8>> {
    let guard = ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to build profiler guard")?;

    sleep(Duration::from_secs(seconds)).await;

    let mut options = Options::default();
    options.image_width = Some(image_width);
    let mut svg = Vec::new();
    guard
        .report()
        .build()
        .context("Failed to build flamegraph report")?
        .flamegraph_with_options(&mut svg, &mut options)
        .context("Failed to render flamegraph")?;

    let mut body = Vec::new();
    let mut encoder = GzEncoder::new(&mut body, Compression::default());
    encoder
        .write_all(&svg)
        .context("Failed to write flamegraph")?;
    encoder
        .finish()
        .context("Failed to finish encoding flamegraph")?;
    Ok(body)
}
