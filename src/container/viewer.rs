//! `viewer.html`: a self-contained snapshot page.
//!
//! The page embeds the manifest and steps as JSON in
//! `<script id="epi-data" type="application/json">` and lists the steps as
//! plain HTML. It is informational only and never checked by the verifier.

use serde_json::json;

use crate::model::{Manifest, Step};

/// Renders the viewer page for a manifest and its steps.
pub(crate) fn render(manifest: &Manifest, steps: &[Step]) -> serde_json::Result<String> {
    let data = serde_json::to_string(&json!({ "manifest": manifest, "steps": steps }))?;
    let title = manifest.workflow_name.as_deref().unwrap_or("EPI recording");
    let signature = match &manifest.signature {
        Some(sig) => format!("Signed: {}", sig.split(':').take(2).collect::<Vec<_>>().join(":")),
        None => "Unsigned".to_string(),
    };

    let rows: String = steps
        .iter()
        .map(|step| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                step.index,
                escape_html(&step.timestamp.to_string()),
                escape_html(&step.kind)
            )
        })
        .collect();

    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
</head>
<body>
<h1>{title}</h1>
<p>{signature} &middot; digest <code>{digest}</code></p>
<table>
<thead><tr><th>#</th><th>Time</th><th>Kind</th></tr></thead>
<tbody>
{rows}</tbody>
</table>
<script id="epi-data" type="application/json">{data}</script>
</body>
</html>
"#,
        title = escape_html(title),
        signature = escape_html(&signature),
        digest = escape_html(&manifest.content_digest),
        rows = rows,
        data = escape_script(&data),
    ))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Keeps embedded JSON from closing the script element early.
fn escape_script(json: &str) -> String {
    json.replace("</", "<\\/").replace("<!--", "<\\u0021--")
}
