//! JUnit-style XML result files, one per test run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::state::TestResult;

/// Write `<testID>.xml` into `results_dir`.
///
/// One `<testcase>` per run, with the in-VM log as CDATA `system-out` and a
/// `<failure>` element when the run did not succeed. Code points that are
/// invalid in XML are replaced with spaces.
pub fn write_xml_log(results_dir: &Path, test_id: &str, result: &TestResult) -> Result<()> {
    fs::create_dir_all(results_dir).with_context(|| format!("create {}", results_dir.display()))?;

    let log = sanitize(&result.tool_log);
    let failures = usize::from(result.error.is_some());

    let mut doc = String::new();
    doc.push_str(&format!(
        "<testsuite tests=\"1\" failures=\"{failures}\" assertions=\"1\">\n"
    ));
    doc.push_str(&format!(
        "<testcase classname=\"test.{test_id}\" name=\"{test_id}.run\" time=\"{:.2}\">",
        result.exec_time.as_secs_f64()
    ));
    doc.push_str("<system-out>\n<![CDATA[\n");
    doc.push_str(&log);
    doc.push_str("]]></system-out>\n");
    if let Some(error) = &result.error {
        doc.push_str(&format!(
            "<failure message=\"{}\">\n",
            escape_attr(&format!("{error:#}"))
        ));
        doc.push_str("<![CDATA[\n");
        doc.push_str(&log);
        doc.push_str("]]>\n</failure>\n");
    }
    doc.push_str("</testcase></testsuite>");

    let path = results_dir.join(format!("{test_id}.xml"));
    fs::write(&path, doc).with_context(|| format!("write {}", path.display()))
}

/// Replace characters outside `[\t\n\r\x20-\x7e]` with spaces.
fn sanitize(log: &str) -> String {
    log.chars()
        .map(|c| match c {
            '\t' | '\n' | '\r' | '\x20'..='\x7e' => c,
            _ => ' ',
        })
        .collect()
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
