//! Helpers for logging plist traffic

/// Renders a plist value as an indented, human readable string
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary as an indented, human readable string
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dictionary(dict, 0)
}

fn print_dictionary(dict: &plist::Dictionary, indentation: usize) -> String {
    let indent = "  ".repeat(indentation + 1);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{indent}{k}: {}", print_plist(v, indentation + 1)))
        .collect();
    format!("{{\n{}\n{}}}", items.join(",\n"), "  ".repeat(indentation))
}

fn print_plist(p: &plist::Value, indentation: usize) -> String {
    match p {
        plist::Value::Array(array) => {
            let indent = "  ".repeat(indentation + 1);
            let items: Vec<String> = array
                .iter()
                .map(|v| format!("{indent}{}", print_plist(v, indentation + 1)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), "  ".repeat(indentation))
        }
        plist::Value::Dictionary(dict) => print_dictionary(dict, indentation),
        plist::Value::Boolean(b) => b.to_string(),
        // Image payloads and signatures would flood the log
        plist::Value::Data(data) => format!("<{} bytes>", data.len()),
        plist::Value::Date(date) => date.to_xml_format(),
        plist::Value::Real(f) => f.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Uid(uid) => format!("Uid({})", uid.get()),
        _ => "Unknown".to_string(),
    }
}
