//! Minimal HTML rendering
//!
//! The HTML views are a thin shell over the streamed data: a test listing
//! for the build page and a `<pre>` block the merged log stream is written
//! into line by line. There is no template engine: the log views are
//! produced incrementally, so the page must be emittable as header /
//! lines / footer fragments.

use loghouse_core::LogLineItem;
use loghouse_storage::{Build, Test};

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// The build page: name, task correlation, and its tests in start order.
pub fn build_page(build: &Build, tests: &[Test]) -> String {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html><head><title>");
    page.push_str(&escape(&build.name));
    page.push_str("</title></head><body>\n<h1>");
    page.push_str(&escape(&build.name));
    page.push_str("</h1>\n");
    if !build.info.task_id.is_empty() {
        page.push_str(&format!("<p>task: {}</p>\n", escape(&build.info.task_id)));
    }
    page.push_str(&format!(
        "<p><a href=\"/build/{}/all\">all logs</a></p>\n<ul>\n",
        escape(&build.id)
    ));
    for test in tests {
        page.push_str(&format!(
            "<li><a href=\"/build/{}/test/{}\">{}</a> ({})</li>\n",
            escape(&build.id),
            escape(&test.id),
            escape(&test.name),
            escape(&test.phase),
        ));
    }
    page.push_str("</ul>\n</body></html>\n");
    page
}

pub fn log_page_header(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title>\n\
         <style>pre {{ margin: 0 }} .global {{ color: #666 }}</style>\n\
         </head><body>\n<h1>{title}</h1>\n<pre>\n",
        title = escape(title)
    )
}

pub fn log_page_footer() -> &'static str {
    "</pre>\n</body></html>\n"
}

/// One merged line; global-log lines are visually distinguishable from
/// test-owned lines.
pub fn log_line_html(item: &LogLineItem) -> String {
    if item.global {
        format!("<span class=\"global\">{}</span>\n", escape(&item.data))
    } else {
        format!("{}\n", escape(&item.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use loghouse_core::LogLine;

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_log_line_marks_provenance() {
        let time = Utc.timestamp_millis_opt(0).unwrap();
        let global = LogLineItem::from_line(LogLine::new(time, "<g>"), true);
        let owned = LogLineItem::from_line(LogLine::new(time, "t"), false);

        assert_eq!(
            log_line_html(&global),
            "<span class=\"global\">&lt;g&gt;</span>\n"
        );
        assert_eq!(log_line_html(&owned), "t\n");
    }
}
