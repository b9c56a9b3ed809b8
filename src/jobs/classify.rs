use crate::schema::{Component, LogLevel};

pub fn classify_level(line: &str) -> LogLevel {
    if line.contains("[ERROR]") || line.contains("Error") || line.contains("error") {
        LogLevel::Error
    } else if line.contains("[WARNING]") || line.contains("Warning") {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}

// order of checks matters: "order items" must win over "order"
pub fn classify_component(line: &str) -> Component {
    let lower = line.to_lowercase();
    if lower.contains("customer") {
        Component::Customers
    } else if lower.contains("order") && lower.contains("items") {
        Component::OrderItems
    } else if lower.contains("order") {
        Component::Orders
    } else if lower.contains("product") {
        Component::Products
    } else {
        Component::Main
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_markers() {
        let cases = [
            ("[ERROR] upload failed", LogLevel::Error),
            ("Error: boom", LogLevel::Error),
            ("no errors here", LogLevel::Error),
            ("[WARNING] PII access denied", LogLevel::Warning),
            ("Warning: slow page", LogLevel::Warning),
            ("[INFO] Page 3: 250 customers", LogLevel::Info),
            ("ERROR without marker", LogLevel::Info),
        ];
        for (line, expected) in cases {
            assert_eq!(classify_level(line), expected, "line: {line}");
        }
    }

    #[test]
    fn component_from_keywords() {
        let cases = [
            ("[SUCCESS] Customer insights completed", Component::Customers),
            ("Starting order items insights", Component::OrderItems),
            ("[INFO] Fetching orders from 2015-01-01", Component::Orders),
            ("Page 2 fetched, products collected: 50", Component::Products),
            ("Processing store: foo.myshopify.com", Component::Main),
        ];
        for (line, expected) in cases {
            assert_eq!(classify_component(line), expected, "line: {line}");
        }
    }
}
