//! Plain-text extraction from fetched HTML pages.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NON_CONTENT: Regex =
        Regex::new(r"(?is)<(script|style|head|footer|nav)\b.*?</(script|style|head|footer|nav)>")
            .unwrap();
    static ref BLOCK_TAG: Regex =
        Regex::new(r"(?i)</?(div|p|h[1-6]|section|article|table|ul|ol|br|tr)\b[^>]*>").unwrap();
    static ref LIST_ITEM: Regex = Regex::new(r"(?i)<li\b[^>]*>").unwrap();
    static ref TABLE_CELL: Regex = Regex::new(r"(?i)<t[dh]\b[^>]*>").unwrap();
    static ref ANY_TAG: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref INLINE_SPACE: Regex = Regex::new(r"[ \t\r\f\v]+").unwrap();
    static ref BLANK_LINES: Regex = Regex::new(r"\n(?: ?\n)+").unwrap();
    static ref NUMERIC_ENTITY: Regex = Regex::new(r"&#(\d+);").unwrap();
    static ref TITLE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
}

/// Readable text of an HTML document: non-content sections dropped, block
/// elements on their own lines, list items as `- ` bullets, cells as ` | `.
pub fn extract_text(html: &str) -> String {
    let text = NON_CONTENT.replace_all(html, "");
    let text = LIST_ITEM.replace_all(&text, "\n- ");
    let text = TABLE_CELL.replace_all(&text, " | ");
    let text = BLOCK_TAG.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = INLINE_SPACE.replace_all(&text, " ");
    let text = BLANK_LINES.replace_all(&text, "\n");

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    decode_entities(&lines.join("\n"))
}

pub fn extract_title(html: &str) -> Option<String> {
    TITLE
        .captures(html)
        .map(|caps| decode_entities(caps[1].trim()))
        .filter(|title| !title.is_empty())
}

pub fn decode_entities(text: &str) -> String {
    let decoded = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures| {
        caps[1]
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    // &amp; last so "&amp;lt;" decodes to "&lt;" and not "<"
    decoded
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&copy;", "©")
        .replace("&reg;", "®")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_drops_scripts_and_keeps_structure() {
        let html = r#"<html><head><title>T</title></head><body>
            <nav><a href="/">Home</a></nav>
            <script>var x = "<p>no</p>";</script>
            <h1>Heading</h1><p>First   paragraph</p>
            <ul><li>one</li><li>two</li></ul>
            <footer>bye</footer></body></html>"#;

        let text = extract_text(html);
        assert_eq!(text, "Heading\nFirst paragraph\n- one\n- two");
    }

    #[test]
    fn test_table_cells_are_pipe_separated() {
        let text = extract_text("<table><tr><td>a</td><td>b</td></tr></table>");
        assert_eq!(text, "| a | b");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &lt;b&gt; &amp; &#65;&copy;"), "a <b> & A©");
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_extract_title() {
        assert_eq!(
            extract_title("<head><title> Fish &amp; Chips </title></head>"),
            Some("Fish & Chips".to_string())
        );
        assert_eq!(extract_title("<p>none</p>"), None);
    }
}
