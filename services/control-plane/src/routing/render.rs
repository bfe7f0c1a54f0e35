//! Proxy configuration rendering.
//!
//! Pure functions from routing entries to nginx configuration text. Output is
//! deterministic: backends, domains and entries are sorted, so an unchanged
//! routing table always renders byte-identical files.

use std::fmt::Write;

use vitrine_namespace::NAME_PREFIX;

use super::RoutingEntry;
use crate::registry::Backend;

/// Placeholder keeping an upstream without live backends syntactically valid.
const DOWN_PLACEHOLDER: &str = "127.0.0.1:65535";

const PROXY_HEADERS: &[&str] = &[
    "proxy_http_version 1.1;",
    "proxy_set_header Host $host;",
    "proxy_set_header X-Real-IP $remote_addr;",
    "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
    "proxy_set_header X-Forwarded-Proto $scheme;",
];

/// Upstream name used in the platform file.
pub fn upstream_name(base_id: &str) -> String {
    format!("{NAME_PREFIX}{base_id}")
}

/// Upstream name used in a tenant's own domain file.
pub fn domain_upstream_name(base_id: &str) -> String {
    format!("{NAME_PREFIX}{base_id}_domains")
}

/// Render an `upstream` block.
pub fn render_upstream(name: &str, backends: &[Backend]) -> String {
    let mut sorted = backends.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut out = String::new();
    let _ = writeln!(out, "upstream {name} {{");
    if sorted.is_empty() {
        let _ = writeln!(out, "    server {DOWN_PLACEHOLDER} down;");
    }
    for backend in &sorted {
        let _ = writeln!(
            out,
            "    server {} weight={};",
            backend.address(),
            backend.weight.max(1)
        );
    }
    out.push_str("}\n");
    out
}

fn push_proxy_location(out: &mut String, location: &str, target: &str) {
    let _ = writeln!(out, "    location {location} {{");
    let _ = writeln!(out, "        proxy_pass {target};");
    for header in PROXY_HEADERS {
        let _ = writeln!(out, "        {header}");
    }
    out.push_str("    }\n");
}

/// Render a tenant's custom-domain file.
pub fn render_tenant_server(entry: &RoutingEntry) -> String {
    let upstream = domain_upstream_name(&entry.base_id);
    let domains = entry.normalized_domains();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Managed by vitrine. {} {} ({})",
        entry.kind, entry.tenant_id, entry.base_id
    );
    out.push_str(&render_upstream(&upstream, &entry.backends));
    out.push('\n');
    out.push_str("server {\n");
    out.push_str("    listen 80;\n");
    let _ = writeln!(out, "    server_name {};", domains.join(" "));
    out.push('\n');
    push_proxy_location(&mut out, "/", &format!("http://{upstream}"));
    out.push_str("}\n");
    out
}

/// Render the platform file: one upstream per entry, and a path location on
/// the platform domain for every tenant without custom domains.
pub fn render_platform(platform_domain: &str, entries: &[RoutingEntry]) -> String {
    let mut sorted: Vec<&RoutingEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.base_id.cmp(&b.base_id));

    let mut out = String::from("# Managed by vitrine. Platform routes.\n");
    for entry in &sorted {
        out.push('\n');
        out.push_str(&render_upstream(&entry.upstream_name, &entry.backends));
    }

    out.push_str("\nserver {\n");
    out.push_str("    listen 80 default_server;\n");
    let _ = writeln!(out, "    server_name {platform_domain};");
    for entry in sorted.iter().filter(|e| e.normalized_domains().is_empty()) {
        out.push('\n');
        push_proxy_location(
            &mut out,
            &format!("/{}/", entry.base_id),
            &format!("http://{}/", entry.upstream_name),
        );
    }
    out.push('\n');
    out.push_str("    location / {\n        return 404;\n    }\n");
    out.push_str("}\n");
    out
}
