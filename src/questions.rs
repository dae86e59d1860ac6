use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::config::is_http_url;

/// Resolve the user-supplied query entries into an ordered FQDN list.
///
/// Each entry is a literal domain, a `@<path>` file reference with one
/// domain per line, or an `http[s]://` URL whose body is a newline
/// separated domain list. Sources are concatenated in the order given so
/// every worker iterates the same sequence.
pub async fn resolve(entries: &[String]) -> Result<Vec<String>> {
	let mut questions = Vec::new();
	for entry in entries {
		if is_http_url(entry) {
			questions.extend(fetch_list(entry).await?);
		} else if let Some(path) = entry.strip_prefix('@') {
			questions.extend(read_list(path)?);
		} else {
			questions.push(fqdn(entry));
		}
	}
	Ok(questions)
}

/// Append the trailing dot if the domain does not already carry one.
pub fn fqdn(domain: &str) -> String {
	if domain.ends_with('.') {
		domain.to_string()
	} else {
		format!("{}.", domain)
	}
}

fn read_list(path: &str) -> Result<Vec<String>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read domain file '{}': {}", path, e))?;
	Ok(parse_lines(&content))
}

async fn fetch_list(url: &str) -> Result<Vec<String>> {
	let client = reqwest::Client::builder()
		.timeout(Duration::from_secs(120))
		.build()?;
	let response = client
		.get(url)
		.send()
		.await
		.map_err(|e| anyhow!("failed to download file '{}' with error '{}'", url, e))?;
	if !response.status().is_success() {
		bail!(
			"failed to download file '{}' with status '{}'",
			url,
			response.status()
		);
	}
	let body = response.text().await?;
	Ok(parse_lines(&body))
}

fn parse_lines(content: &str) -> Vec<String> {
	content
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.map(fqdn)
		.collect()
}
