//! Reads URLs of license files, one per line, downloads each one and writes
//! `url<TAB>license` lines to an output file.
//!
//! ```text
//! cargo run --example license_scan -- urls.txt licenses.tsv
//! RUST_LOG=debug LOG_FORMAT=json cargo run --example license_scan -- urls.txt licenses.tsv
//! ```

use anyhow::Context;
use pipeflow::prelude::*;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Known licenses: the text that marks them, then their SPDX identifier.
const KNOWN_LICENSES: &[(&str, &str)] = &[
    ("Permission is hereby granted, free of charge", "MIT"),
    ("Apache License", "Apache-2.0"),
    ("GNU GENERAL PUBLIC LICENSE", "GPL-3.0"),
    ("GNU LESSER GENERAL PUBLIC LICENSE", "LGPL-3.0"),
    ("Mozilla Public License", "MPL-2.0"),
    ("Redistribution and use in source and binary forms", "BSD-3-Clause"),
    ("This is free and unencumbered software", "Unlicense"),
];

fn identify(text: &str) -> &'static str {
    KNOWN_LICENSES
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .or_else(|| KNOWN_LICENSES.iter().find(|(_, id)| text.contains(id)))
        .map_or("Unknown", |&(_, id)| id)
}

struct Fetched {
    url: String,
    body: Option<String>,
}

async fn fetch(client: &reqwest::Client, url: &str) -> Option<String> {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(url, error = %err, "Download failed");
            return None;
        }
    };
    match response.error_for_status() {
        Ok(response) => response.text().await.ok(),
        Err(err) => {
            warn!(url, error = %err, "Download rejected");
            None
        }
    }
}

/// Writes each result line and flushes the file at end-of-stream.
struct LineWriter {
    out: tokio::io::BufWriter<tokio::fs::File>,
    lines: u64,
}

#[async_trait::async_trait]
impl Sink<String> for LineWriter {
    type Output = u64;

    async fn consume(&mut self, line: String) -> anyhow::Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.lines += 1;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<u64> {
        self.out.flush().await?;
        Ok(self.lines)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .map(|v| v.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();
    init_logging(format)?;

    let mut args = std::env::args().skip(1);
    let input = args.next().context("usage: license_scan <urls-file> <output-file>")?;
    let output = args.next().unwrap_or_else(|| "licenses.tsv".to_string());

    let lines = std::io::BufReader::new(
        std::fs::File::open(&input).with_context(|| format!("opening {input}"))?,
    )
    .lines()
    .map_while(std::result::Result::ok);

    let client = Arc::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?,
    );
    let writer = tokio::io::BufWriter::new(
        tokio::fs::File::create(&output)
            .await
            .with_context(|| format!("creating {output}"))?,
    );

    let report = Pipeline::builder("license-scan")
        .event_sink(Arc::new(LoggingEventSink::debug()))
        .source_capacity(50_000)
        .from_blocking_iter(lines)
        .filter_map("trim", StageOptions::default(), |line: String| {
            let url = line.trim();
            (!url.is_empty() && !url.starts_with('#')).then(|| url.to_string())
        })
        .map_async("download", StageOptions::concurrent(8), move |url: String| {
            let client = client.clone();
            async move {
                let body = fetch(&client, &url).await;
                Ok(Fetched { url, body })
            }
        })
        .map("identify", StageOptions::concurrent(2), |fetched: Fetched| {
            let license = fetched.body.as_deref().map_or("Unknown", identify);
            format!("{}\t{license}\n", fetched.url)
        })
        .sink_with("write", LineWriter { out: writer, lines: 0 })
        .run()
        .await?;

    info!(
        sourced = report.items_sourced,
        written = report.items_sunk,
        elapsed_ms = report.elapsed_ms(),
        "License scan finished"
    );
    println!("Wrote {} lines to {output} in {:?}", report.output, report.elapsed);
    Ok(())
}
