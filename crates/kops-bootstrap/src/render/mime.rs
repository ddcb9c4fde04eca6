use crate::model::UserData;

/// Fixed boundary keeps the output byte-stable.
pub(crate) const BOUNDARY: &str = "MIMEBOUNDARY";

/// Builds a `multipart/mixed` document: the boot script first, then each
/// additional part in order.
pub(crate) fn multipart(boot_script: &str, parts: &[UserData]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Content-Type: multipart/mixed; boundary=\"{BOUNDARY}\"\r\n"));
    out.push_str("MIME-Version: 1.0\r\n\r\n");

    write_part(&mut out, "nodeup.sh", "text/x-shellscript", boot_script);
    for part in parts {
        write_part(&mut out, &part.name, &part.content_type, &part.content);
    }

    out.push_str(&format!("--{BOUNDARY}--\r\n"));
    out
}

fn write_part(out: &mut String, file_name: &str, content_type: &str, content: &str) {
    out.push_str(&format!("--{BOUNDARY}\r\n"));
    out.push_str(&format!("Content-Disposition: attachment; filename=\"{file_name}\"\r\n"));
    out.push_str("Content-Transfer-Encoding: 7bit\r\n");
    out.push_str(&format!("Content-Type: {content_type}\r\n"));
    out.push_str("Mime-Version: 1.0\r\n\r\n");
    out.push_str(content);
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_layout() {
        let parts = vec![UserData {
            name: "extra.sh".to_string(),
            content_type: "text/x-shellscript".to_string(),
            content: "echo extra".to_string(),
        }];
        let doc = multipart("#!/bin/bash\n", &parts);
        assert!(doc.starts_with("Content-Type: multipart/mixed; boundary=\"MIMEBOUNDARY\"\r\n"));
        let nodeup = doc.find("filename=\"nodeup.sh\"").expect("boot part");
        let extra = doc.find("filename=\"extra.sh\"").expect("extra part");
        assert!(nodeup < extra);
        assert_eq!(doc.matches("--MIMEBOUNDARY\r\n").count(), 2);
        assert!(doc.ends_with("--MIMEBOUNDARY--\r\n"));
    }
}
