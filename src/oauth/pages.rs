//! HTML pages shown in the user's browser at the end of the consent flow

/// Escape text for inclusion in HTML
fn escape(text: &str) -> String {
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

fn page(title: &str, icon: &str, background: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: {background};
            color: white;
        }}
        .container {{
            text-align: center;
            padding: 2rem;
            background: rgba(255,255,255,0.1);
            border-radius: 16px;
            max-width: 420px;
        }}
        .icon {{ font-size: 4rem; margin-bottom: 1rem; }}
        h1 {{ margin: 0 0 0.5rem 0; }}
        p {{ margin: 0; opacity: 0.9; }}
        .error-code {{ font-family: monospace; margin-top: 1rem; opacity: 0.7; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="icon">{icon}</div>
        <h1>{title}</h1>
        {body}
    </div>
</body>
</html>"#
    )
}

/// Upstream access granted
pub fn success_page() -> String {
    page(
        "Authorization Successful",
        "✓",
        "linear-gradient(135deg, #667eea 0%, #764ba2 100%)",
        "<p>The CRM granted access. You can close this window and return to your MCP client.</p>",
    )
}

/// Consent flow failed
pub fn error_page(error: &str, description: &str) -> String {
    page(
        "Authorization Failed",
        "✗",
        "linear-gradient(135deg, #e74c3c 0%, #c0392b 100%)",
        &format!(
            r#"<p>{}</p>
        <p class="error-code">Error: {}</p>"#,
            escape(description),
            escape(error)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_page_escapes_input() {
        let html = error_page("invalid_request", "<script>alert(1)</script>");
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("Error: invalid_request"));
    }

    #[test]
    fn success_page_is_html() {
        assert!(success_page().starts_with("<!DOCTYPE html>"));
    }
}
