//! Minimal RFC 4180 writer: CRLF record separators, fields quoted only when
//! they contain a comma, a double quote, CR or LF.

use std::io::{self, Write};

use serde_json::Value;

pub(crate) struct CsvWriter<W> {
    out: W,
}

impl<W: Write> CsvWriter<W> {
    pub(crate) fn new(out: W) -> Self {
        Self { out }
    }

    pub(crate) fn record<I, S>(&mut self, fields: I) -> io::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (index, field) in fields.into_iter().enumerate() {
            if index > 0 {
                self.out.write_all(b",")?;
            }
            write_field(&mut self.out, field.as_ref())?;
        }
        self.out.write_all(b"\r\n")
    }

    pub(crate) fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

fn write_field<W: Write>(out: &mut W, field: &str) -> io::Result<()> {
    if !field.contains([',', '"', '\r', '\n']) {
        return out.write_all(field.as_bytes());
    }
    out.write_all(b"\"")?;
    out.write_all(field.replace('"', "\"\"").as_bytes())?;
    out.write_all(b"\"")
}

/// Cell text for a captured value: strings verbatim, null empty, anything
/// else as compact JSON.
pub(crate) fn value_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(rows: &[&[&str]]) -> String {
        let mut writer = CsvWriter::new(Vec::new());
        for row in rows {
            if let Err(err) = writer.record(row.iter()) {
                panic!("write failed: {err}");
            }
        }
        match writer.finish() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => panic!("flush failed: {err}"),
        }
    }

    #[test]
    fn plain_fields_are_unquoted() {
        assert_eq!(render(&[&["a", "b", ""]]), "a,b,\r\n");
    }

    #[test]
    fn special_characters_force_quoting() {
        assert_eq!(
            render(&[&["x,y", "say \"hi\"", "two\nlines"]]),
            "\"x,y\",\"say \"\"hi\"\"\",\"two\nlines\"\r\n"
        );
    }

    #[test]
    fn value_cells() {
        assert_eq!(value_cell(&Value::Null), "");
        assert_eq!(value_cell(&json!("héllo")), "héllo");
        assert_eq!(value_cell(&json!({"k": [1, 2]})), "{\"k\":[1,2]}");
        assert_eq!(value_cell(&json!(2.5)), "2.5");
    }
}
