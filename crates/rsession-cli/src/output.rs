//! Printing engine values the way the R console would.

use rsession_core::Value;

fn number(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{}", x)
    }
}

fn integer(i: i32) -> String {
    if i == i32::MIN {
        "NA".to_string()
    } else {
        i.to_string()
    }
}

/// Console rendering of a value, e.g. `[1] 1.5 2`.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Logical(b) => format!("[1] {}", if *b { "TRUE" } else { "FALSE" }),
        Value::Integer(i) => format!("[1] {}", integer(*i)),
        Value::Integers(v) => format!(
            "[1] {}",
            v.iter().map(|&i| integer(i)).collect::<Vec<_>>().join(" ")
        ),
        Value::Scalar(x) => format!("[1] {}", number(*x)),
        Value::Numeric(v) => format!(
            "[1] {}",
            v.iter().map(|&x| number(x)).collect::<Vec<_>>().join(" ")
        ),
        Value::Text(s) => format!("[1] {:?}", s),
    }
}

pub fn print_value(value: &Value) {
    println!("{}", format_value(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&Value::Null), "NULL");
        assert_eq!(format_value(&Value::Scalar(1.5)), "[1] 1.5");
        assert_eq!(
            format_value(&Value::Numeric(vec![1.0, f64::NAN, f64::INFINITY])),
            "[1] 1 NaN Inf"
        );
        assert_eq!(format_value(&Value::Integers(vec![3, i32::MIN])), "[1] 3 NA");
        assert_eq!(format_value(&Value::Text("mz".to_string())), "[1] \"mz\"");
    }
}
