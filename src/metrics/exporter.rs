//! Prometheus text exposition served on `GET /metrics`.
//!
//! Metric names are consumed by existing dashboards; treat them as stable.

use std::fmt::Write as _;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Histogram, MetricsCollector, MetricsSnapshot};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const MAX_REQUEST_BYTES: usize = 4096;

pub fn render_exposition(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    header(&mut out, "pi_dashboard_render_duration_seconds", "histogram", "Time spent rendering the dashboard");
    for (render_type, hist) in &snapshot.render_duration {
        histogram(&mut out, "pi_dashboard_render_duration_seconds", ("render_type", render_type), hist);
    }

    header(
        &mut out,
        "pi_dashboard_display_update_duration_seconds",
        "histogram",
        "Time spent updating the e-ink display",
    );
    for (refresh_type, hist) in &snapshot.display_duration {
        histogram(
            &mut out,
            "pi_dashboard_display_update_duration_seconds",
            ("refresh_type", refresh_type),
            hist,
        );
    }

    header(&mut out, "pi_dashboard_full_cycle_duration_seconds", "histogram", "Duration of a complete update cycle");
    unlabelled_histogram(&mut out, "pi_dashboard_full_cycle_duration_seconds", &snapshot.cycle_duration);

    header(&mut out, "pi_dashboard_updates_total", "counter", "Update cycles by outcome");
    for (status, count) in &snapshot.updates_total {
        let _ = writeln!(out, "pi_dashboard_updates_total{{status=\"{status}\"}} {count}");
    }

    header(&mut out, "pi_dashboard_render_attempts_total", "counter", "Render attempts by renderer and result");
    for (render_type, by_status) in &snapshot.render_attempts_total {
        for (status, count) in by_status {
            let _ = writeln!(
                out,
                "pi_dashboard_render_attempts_total{{render_type=\"{render_type}\",status=\"{status}\"}} {count}"
            );
        }
    }

    header(&mut out, "pi_dashboard_display_refresh_total", "counter", "Display refreshes by type");
    for (refresh_type, count) in &snapshot.display_refresh_total {
        let _ = writeln!(
            out,
            "pi_dashboard_display_refresh_total{{refresh_type=\"{refresh_type}\"}} {count}"
        );
    }

    header(
        &mut out,
        "pi_dashboard_update_timing_offset_seconds",
        "histogram",
        "Offset between intended update time and actual update completion time",
    );
    unlabelled_histogram(
        &mut out,
        "pi_dashboard_update_timing_offset_seconds",
        &snapshot.update_timing_offset,
    );

    header(&mut out, "pi_dashboard_service_status", "gauge", "Service status indicators");
    for (component, up) in &snapshot.service_status {
        let _ = writeln!(
            out,
            "pi_dashboard_service_status{{component=\"{component}\"}} {}",
            u8::from(*up)
        );
    }

    header(
        &mut out,
        "pi_dashboard_time_validation_total",
        "counter",
        "Time validations performed, by result",
    );
    for (status, count) in &snapshot.time_validation_total {
        let _ = writeln!(out, "pi_dashboard_time_validation_total{{status=\"{status}\"}} {count}");
    }
    header(
        &mut out,
        "pi_dashboard_time_validation_warnings_total",
        "counter",
        "Time validation warnings issued",
    );
    let _ = writeln!(
        out,
        "pi_dashboard_time_validation_warnings_total {}",
        snapshot.time_validation_warnings_total
    );
    header(
        &mut out,
        "pi_dashboard_time_offset_minutes",
        "histogram",
        "Offset between displayed and system time in minutes",
    );
    unlabelled_histogram(&mut out, "pi_dashboard_time_offset_minutes", &snapshot.time_offset_minutes);

    let system = &snapshot.system;
    if let Some(temp) = system.temperature_celsius {
        gauge(&mut out, "pi_dashboard_cpu_temperature_celsius", "CPU temperature", temp as f64);
    }
    gauge(&mut out, "pi_dashboard_memory_usage_percent", "Memory usage", system.memory_percent as f64);
    gauge(&mut out, "pi_dashboard_cpu_usage_percent", "CPU usage", system.cpu_percent as f64);
    if let Some(disk) = system.disk_percent {
        gauge(&mut out, "pi_dashboard_disk_usage_percent", "Root filesystem usage", disk as f64);
    }
    if let Some(mb) = system.browser_memory_mb {
        gauge(&mut out, "pi_dashboard_browser_memory_mb", "Persistent browser resident memory", mb);
    }
    gauge(
        &mut out,
        "pi_dashboard_browser_processes",
        "Chromium processes on the host",
        system.browser_processes as f64,
    );
    gauge(
        &mut out,
        "pi_dashboard_update_interval_seconds",
        "Configured update interval",
        snapshot.update_interval_seconds,
    );
    out
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    header(out, name, "gauge", help);
    let _ = writeln!(out, "{name} {value}");
}

fn histogram(out: &mut String, name: &str, label: (&str, &str), hist: &Histogram) {
    let (key, value) = label;
    for (count, bound) in hist.buckets.iter().zip(&hist.bounds) {
        let _ = writeln!(out, "{name}_bucket{{{key}=\"{value}\",le=\"{bound}\"}} {count}");
    }
    let _ = writeln!(out, "{name}_bucket{{{key}=\"{value}\",le=\"+Inf\"}} {}", hist.count);
    let _ = writeln!(out, "{name}_sum{{{key}=\"{value}\"}} {}", hist.sum);
    let _ = writeln!(out, "{name}_count{{{key}=\"{value}\"}} {}", hist.count);
}

fn unlabelled_histogram(out: &mut String, name: &str, hist: &Histogram) {
    for (count, bound) in hist.buckets.iter().zip(&hist.bounds) {
        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {count}");
    }
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", hist.count);
    let _ = writeln!(out, "{name}_sum {}", hist.sum);
    let _ = writeln!(out, "{name}_count {}", hist.count);
}

/// Bind `0.0.0.0:port` and serve until `cancel` fires.
pub async fn spawn_exporter(
    port: u16,
    metrics: MetricsCollector,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint on {addr}"))?;
    log_info!("metrics available at http://{addr}/metrics");
    Ok(tokio::spawn(serve(listener, metrics, cancel)))
}

pub async fn serve(listener: TcpListener, metrics: MetricsCollector, cancel: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &metrics).await {
                            log_debug!("metrics request from {peer} failed: {err:#}");
                        }
                    });
                }
                Err(err) => log_warn!("metrics accept failed: {err}"),
            },
            _ = cancel.cancelled() => {
                log_info!("metrics endpoint shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, metrics: &MetricsCollector) -> Result<()> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") && buf.len() < MAX_REQUEST_BYTES {
        let read = stream.read(&mut chunk).await.context("reading request")?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    let request = String::from_utf8_lossy(&buf);
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let (method, path) = (parts.next(), parts.next());

    let response = match (method, path) {
        (Some("GET"), Some("/metrics")) => {
            let body = render_exposition(&metrics.snapshot().await);
            http_response("200 OK", "text/plain; version=0.0.4; charset=utf-8", &body)
        }
        (Some("GET"), Some("/")) => http_response(
            "200 OK",
            "text/html; charset=utf-8",
            "<html><body><a href=\"/metrics\">metrics</a></body></html>",
        ),
        _ => http_response("404 Not Found", "text/plain", "not found\n"),
    };
    stream.write_all(response.as_bytes()).await.context("writing response")?;
    stream.shutdown().await.ok();
    Ok(())
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}
