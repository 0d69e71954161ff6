//! Plain-text alternative derived from rendered HTML.

/// Convert a rendered HTML document into readable plain text.
///
/// `<head>`, `<style>` and `<script>` content is dropped, block-level closing
/// tags become line breaks, and links keep their target as `label (url)`.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;
    let mut pending_href: Option<String> = None;
    let mut link_text_start = 0;

    while let Some(lt) = rest.find('<') {
        push_text(&mut out, &rest[..lt]);
        let after = &rest[lt + 1..];
        let Some(gt) = after.find('>') else {
            // Unterminated tag, keep the remainder as text.
            push_text(&mut out, &rest[lt..]);
            rest = "";
            break;
        };
        let tag = &after[..gt];
        rest = &after[gt + 1..];

        let name = tag_name(tag);
        match name.as_str() {
            "head" | "style" | "script" | "title" => {
                let close = format!("</{name}");
                rest = match find_ignore_case(rest, &close) {
                    Some(idx) => rest[idx..].find('>').map_or("", |g| &rest[idx + g + 1..]),
                    None => "",
                };
            }
            "br" | "/p" | "/div" | "/tr" | "/table" | "/li" | "/h1" | "/h2" | "/h3" | "/h4" => {
                out.push('\n');
            }
            "td" | "th" => {
                if !out.ends_with('\n') && !out.is_empty() {
                    out.push_str(": ");
                }
            }
            "/td" | "/th" => {
                if out.ends_with(": ") {
                    out.truncate(out.len() - 2);
                }
            }
            "li" => out.push_str("- "),
            "a" => {
                pending_href = attribute(tag, "href");
                link_text_start = out.len();
            }
            "/a" => {
                if let Some(href) = pending_href.take() {
                    let href = href.trim_start_matches("mailto:");
                    let label = out[link_text_start..].trim();
                    if label != href {
                        out.push_str(&format!(" ({href})"));
                    }
                }
            }
            _ => {}
        }
    }
    push_text(&mut out, rest);

    tidy(&out)
}

fn push_text(out: &mut String, text: &str) {
    let decoded = decode_entities(text);
    let mut last_space = out.ends_with(' ') || out.ends_with('\n') || out.is_empty();
    for ch in decoded.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
}

fn tag_name(tag: &str) -> String {
    tag.trim()
        .split(|c: char| c.is_whitespace() || c == '/' && !tag.trim().starts_with('/'))
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

fn attribute(tag: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}=");
    let idx = find_ignore_case(tag, &needle)?;
    let value = &tag[idx + needle.len()..];
    let quote = value.chars().next()?;
    if quote == '"' || quote == '\'' {
        let inner = &value[1..];
        inner.find(quote).map(|end| decode_entities(&inner[..end]))
    } else {
        value.split_whitespace().next().map(decode_entities)
    }
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&#x60;", "`")
        .replace("&#x3D;", "=")
        .replace("&copy;", "(c)")
        .replace("&amp;", "&")
}

/// Trim each line and collapse runs of blank lines.
fn tidy(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_head_and_tags() {
        let html = "<html><head><title>T</title><style>p { color: red; }</style></head>\
                    <body><h1>Hello</h1><p>Your code is <strong>42</strong>.</p></body></html>";
        assert_eq!(html_to_text(html), "Hello\nYour code is 42.");
    }

    #[test]
    fn keeps_link_targets() {
        let html = r#"<p><a class="button" href="https://example.com/reset?t=1&amp;u=2">Reset password</a></p>"#;
        assert_eq!(
            html_to_text(html),
            "Reset password (https://example.com/reset?t=1&u=2)"
        );
    }

    #[test]
    fn mailto_link_with_same_label_is_not_repeated() {
        let html = r#"<p>Contact <a href="mailto:help@example.com">help@example.com</a></p>"#;
        assert_eq!(html_to_text(html), "Contact help@example.com");
    }

    #[test]
    fn table_rows_become_label_value_lines() {
        let html = "<table><tr><td>Date</td><td>Friday</td></tr><tr><td>Time</td><td>10:00</td></tr></table>";
        assert_eq!(html_to_text(html), "Date: Friday\nTime: 10:00");
    }

    #[test]
    fn decodes_entities_and_collapses_whitespace() {
        let html = "<p>Tom &amp; Jerry   &lt;3</p>\n\n\n<p>&copy; 2024</p>";
        assert_eq!(html_to_text(html), "Tom & Jerry <3\n(c) 2024");
    }
}
