use crate::error::TemplateError;

/// One parsed piece of a template. Segments are evaluated left to right and
/// concatenated; `{% %}` and `{= =}` consume their whole span without
/// looking for nested `{...}` forms, per spec section 4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    FullArg,
    Basename,
    Dirname,
    StripExt,
    BasenameStripExt,
    BasenameStripAllExt,
    Index(i64),
    Slice(Option<i64>, Option<i64>, Option<i64>),
    Subshell(String),
    Expr(String),
}

/// Parse a template into segments. A hard parse error here is what lets the
/// submitter reject a bad template at submission time instead of at
/// dispatch (spec section 4.1).
pub fn parse(template: &str) -> Result<Vec<Segment>, TemplateError> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            // `{` is ASCII, so this slice always lands on a char boundary;
            // push the whole run at once instead of decoding byte-by-byte,
            // which would corrupt multi-byte UTF-8 literal text.
            let next_brace = template[i..].find('{').map(|p| i + p).unwrap_or(bytes.len());
            literal.push_str(&template[i..next_brace]);
            i = next_brace;
            continue;
        }

        let start = i;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        if template[i..].starts_with("{//}") {
            segments.push(Segment::Dirname);
            i += 4;
        } else if template[i..].starts_with("{/.}") {
            segments.push(Segment::BasenameStripExt);
            i += 4;
        } else if template[i..].starts_with("{/-}") {
            segments.push(Segment::BasenameStripAllExt);
            i += 4;
        } else if template[i..].starts_with("{/}") {
            segments.push(Segment::Basename);
            i += 3;
        } else if template[i..].starts_with("{.}") {
            segments.push(Segment::StripExt);
            i += 3;
        } else if template[i..].starts_with("{}") {
            segments.push(Segment::FullArg);
            i += 2;
        } else if template[i..].starts_with("{[") {
            let close = template[i..]
                .find("]}")
                .map(|p| p + i)
                .ok_or(TemplateError::UnbalancedDelimiter(start))?;
            let body = &template[i + 2..close];
            segments.push(parse_index_or_slice(body, start)?);
            i = close + 2;
        } else if template[i..].starts_with("{%") {
            let close = template[i..]
                .find("%}")
                .map(|p| p + i)
                .ok_or(TemplateError::UnbalancedDelimiter(start))?;
            let body = template[i + 2..close].trim().to_string();
            segments.push(Segment::Subshell(body));
            i = close + 2;
        } else if template[i..].starts_with("{=") {
            let close = template[i..]
                .find("=}")
                .map(|p| p + i)
                .ok_or(TemplateError::UnbalancedDelimiter(start))?;
            let body = template[i + 2..close].trim().to_string();
            segments.push(Segment::Expr(body));
            i = close + 2;
        } else {
            return Err(TemplateError::UnknownForm(start));
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

fn parse_index_or_slice(body: &str, start: usize) -> Result<Segment, TemplateError> {
    if body.contains(':') {
        let parts: Vec<&str> = body.splitn(3, ':').collect();
        let a = parse_opt_i64(parts.first().copied().unwrap_or(""), start)?;
        let b = parse_opt_i64(parts.get(1).copied().unwrap_or(""), start)?;
        let s = parse_opt_i64(parts.get(2).copied().unwrap_or(""), start)?;
        Ok(Segment::Slice(a, b, s))
    } else {
        let n: i64 = body
            .trim()
            .parse()
            .map_err(|_| TemplateError::UnknownForm(start))?;
        Ok(Segment::Index(n))
    }
}

fn parse_opt_i64(s: &str, start: usize) -> Result<Option<i64>, TemplateError> {
    let s = s.trim();
    if s.is_empty() {
        Ok(None)
    } else {
        s.parse().map(Some).map_err(|_| TemplateError::UnknownForm(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_arg_default_template() {
        assert_eq!(parse("{}").unwrap(), vec![Segment::FullArg]);
    }

    #[test]
    fn parses_literal_and_substitution() {
        assert_eq!(
            parse("echo {}").unwrap(),
            vec![Segment::Literal("echo ".into()), Segment::FullArg]
        );
    }

    #[test]
    fn parses_path_forms() {
        assert_eq!(parse("{/}").unwrap(), vec![Segment::Basename]);
        assert_eq!(parse("{//}").unwrap(), vec![Segment::Dirname]);
        assert_eq!(parse("{.}").unwrap(), vec![Segment::StripExt]);
        assert_eq!(parse("{/.}").unwrap(), vec![Segment::BasenameStripExt]);
        assert_eq!(parse("{/-}").unwrap(), vec![Segment::BasenameStripAllExt]);
    }

    #[test]
    fn parses_index_and_slice() {
        assert_eq!(parse("{[1]}").unwrap(), vec![Segment::Index(1)]);
        assert_eq!(parse("{[-1]}").unwrap(), vec![Segment::Index(-1)]);
        assert_eq!(
            parse("{[1:3]}").unwrap(),
            vec![Segment::Slice(Some(1), Some(3), None)]
        );
        assert_eq!(
            parse("{[:3:2]}").unwrap(),
            vec![Segment::Slice(None, Some(3), Some(2))]
        );
    }

    #[test]
    fn parses_subshell_and_expr_without_nested_expansion() {
        assert_eq!(
            parse("{% echo {} @ %}").unwrap(),
            vec![Segment::Subshell("echo {} @".into())]
        );
        assert_eq!(
            parse("{= x + 1 =}").unwrap(),
            vec![Segment::Expr("x + 1".into())]
        );
    }

    #[test]
    fn unbalanced_delimiter_is_a_parse_error() {
        assert!(matches!(
            parse("{[1:3}"),
            Err(TemplateError::UnbalancedDelimiter(_))
        ));
        assert!(matches!(
            parse("{% echo @"),
            Err(TemplateError::UnbalancedDelimiter(_))
        ));
    }

    #[test]
    fn unknown_form_is_a_parse_error() {
        assert!(matches!(parse("{bogus}"), Err(TemplateError::UnknownForm(_))));
    }
}
