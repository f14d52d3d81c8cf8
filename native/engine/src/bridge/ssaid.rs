//! Per-app device-scoped ids (SSAID) stored in the settings provider XML.

use lazy_regex::regex;

const EMPTY_DOCUMENT: &str =
    "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\n<settings version=\"-1\">\n</settings>\n";

fn attributes(element: &str) -> Vec<(String, String)> {
    regex!(r#"([\w:]+)="([^"]*)""#)
        .captures_iter(element)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn attribute<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn render(attrs: &[(String, String)]) -> String {
    let body: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("<setting {} />", body.join(" "))
}

/// Value of the setting owned by `package`.
pub fn find(xml: &str, package: &str) -> Option<String> {
    regex!(r"<setting\s[^>]*?/>").find_iter(xml).find_map(|m| {
        let attrs = attributes(m.as_str());
        (attribute(&attrs, "package") == Some(package))
            .then(|| attribute(&attrs, "value").map(str::to_string))
            .flatten()
    })
}

/// Returns `xml` with the setting of `package` set to `value`, adding one if missing.
pub fn upsert(xml: &str, package: &str, uid: i64, value: &str) -> String {
    let xml = if xml.contains("</settings>") { xml.to_string() } else { EMPTY_DOCUMENT.to_string() };
    let mut max_id: i64 = -1;
    let mut existing: Option<(std::ops::Range<usize>, Vec<(String, String)>)> = None;
    for m in regex!(r"<setting\s[^>]*?/>").find_iter(&xml) {
        let attrs = attributes(m.as_str());
        if let Some(id) = attribute(&attrs, "id").and_then(|id| id.parse::<i64>().ok()) {
            max_id = max_id.max(id);
        }
        if existing.is_none() && attribute(&attrs, "package") == Some(package) {
            existing = Some((m.range(), attrs));
        }
    }

    match existing {
        Some((range, mut attrs)) => {
            for (key, current) in attrs.iter_mut() {
                if key == "value" || key == "defaultValue" {
                    *current = value.to_string();
                }
            }
            let mut updated = xml.clone();
            updated.replace_range(range, &render(&attrs));
            updated
        }
        None => {
            let attrs: Vec<(String, String)> = [
                ("id", (max_id + 1).to_string()),
                ("name", uid.to_string()),
                ("value", value.to_string()),
                ("package", package.to_string()),
                ("defaultValue", value.to_string()),
                ("defaultSysSet", "false".to_string()),
                ("tag", "null".to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
            let insert_at = xml.rfind("</settings>").unwrap_or(xml.len());
            let mut updated = xml.clone();
            updated.insert_str(insert_at, &format!("  {}\n", render(&attrs)));
            updated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<settings version="-1">
  <setting id="0" name="userkey" value="ABCDEF" package="android" defaultSysSet="true" />
  <setting id="3" name="10123" value="0123456789abcdef" package="com.example.app" defaultValue="0123456789abcdef" defaultSysSet="false" tag="null" />
</settings>
"#;

    #[test]
    fn finds_value_by_package() {
        assert_eq!(find(SAMPLE, "com.example.app").as_deref(), Some("0123456789abcdef"));
        assert_eq!(find(SAMPLE, "com.other.app"), None);
    }

    #[test]
    fn updates_existing_setting_in_place() {
        let updated = upsert(SAMPLE, "com.example.app", 10123, "ffffffffffffffff");
        assert_eq!(find(&updated, "com.example.app").as_deref(), Some("ffffffffffffffff"));
        assert_eq!(find(&updated, "android").as_deref(), Some("ABCDEF"));
        assert_eq!(updated.matches("<setting ").count(), 2);
        assert!(updated.contains(r#"defaultValue="ffffffffffffffff""#));
    }

    #[test]
    fn inserts_missing_setting_with_next_id() {
        let updated = upsert(SAMPLE, "com.new.app", 10200, "1111222233334444");
        assert_eq!(find(&updated, "com.new.app").as_deref(), Some("1111222233334444"));
        assert!(updated.contains(r#"<setting id="4" name="10200""#));
        assert!(updated.trim_end().ends_with("</settings>"));

        let fresh = upsert("", "com.new.app", 10200, "1111222233334444");
        assert!(fresh.contains(r#"<setting id="0" name="10200""#));
    }
}
