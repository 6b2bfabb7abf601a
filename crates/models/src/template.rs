use crate::ModelError;

/// Template is a bash-style brace-range name template, e.g.
/// `shard-{0..9}.tar` or `obj-{000..100}-{a..c}`. Expands to the full
/// cartesian product in range order; numeric ranges honor the padding
/// of their lower bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Range { start: i64, end: i64, pad: usize },
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| ModelError::InvalidTemplate(text.to_string()))?;
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let body = &rest[open + 1..close];
            let (lo, hi) = body
                .split_once("..")
                .ok_or_else(|| ModelError::InvalidTemplate(text.to_string()))?;
            let start: i64 = lo
                .parse()
                .map_err(|_| ModelError::InvalidTemplate(text.to_string()))?;
            let end: i64 = hi
                .parse()
                .map_err(|_| ModelError::InvalidTemplate(text.to_string()))?;
            if end < start {
                return Err(ModelError::InvalidTemplate(text.to_string()));
            }
            let pad = if lo.starts_with('0') && lo.len() > 1 {
                lo.len()
            } else {
                0
            };
            segments.push(Segment::Range { start, end, pad });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// Total number of expanded names.
    pub fn count(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(_) => 1usize,
                Segment::Range { start, end, .. } => (end - start + 1) as usize,
            })
            .product()
    }

    /// All expanded names, in range order.
    pub fn iter(&self) -> TemplateIter<'_> {
        TemplateIter {
            template: self,
            next: 0,
            count: self.count(),
        }
    }

    fn render(&self, mut index: usize) -> String {
        // Mixed-radix decode, last range varying fastest.
        let radices: Vec<usize> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(_) => 1,
                Segment::Range { start, end, .. } => (end - start + 1) as usize,
            })
            .collect();
        let mut digits = vec![0usize; radices.len()];
        for (i, radix) in radices.iter().enumerate().rev() {
            digits[i] = index % radix;
            index /= radix;
        }
        let mut out = String::new();
        for (seg, digit) in self.segments.iter().zip(digits) {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Range { start, pad, .. } => {
                    let val = start + digit as i64;
                    if *pad > 0 {
                        out.push_str(&format!("{:0width$}", val, width = *pad));
                    } else {
                        out.push_str(&val.to_string());
                    }
                }
            }
        }
        out
    }

    /// Whether `name` is one of the expanded names. Linear only in the
    /// segment count, not the expansion size.
    pub fn matches(&self, name: &str) -> bool {
        self.matches_inner(name, 0)
    }

    fn matches_inner(&self, rest: &str, seg: usize) -> bool {
        let Some(segment) = self.segments.get(seg) else {
            return rest.is_empty();
        };
        match segment {
            Segment::Literal(text) => rest
                .strip_prefix(text.as_str())
                .map(|tail| self.matches_inner(tail, seg + 1))
                .unwrap_or(false),
            Segment::Range { start, end, pad } => {
                // Try every plausible digit-prefix length.
                let max_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
                for len in 1..=max_len {
                    let (digits, tail) = rest.split_at(len);
                    if *pad > 0 && digits.len() != *pad {
                        continue;
                    }
                    if *pad == 0 && digits.len() > 1 && digits.starts_with('0') {
                        continue;
                    }
                    let Ok(val) = digits.parse::<i64>() else {
                        continue;
                    };
                    if val >= *start && val <= *end && self.matches_inner(tail, seg + 1) {
                        return true;
                    }
                }
                false
            }
        }
    }
}

pub struct TemplateIter<'a> {
    template: &'a Template,
    next: usize,
    count: usize,
}

impl Iterator for TemplateIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.next >= self.count {
            return None;
        }
        let name = self.template.render(self.next);
        self.next += 1;
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_range_expands_in_order() {
        let t = Template::parse("shard-{0..9}.tar").unwrap();
        let names: Vec<_> = t.iter().collect();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "shard-0.tar");
        assert_eq!(names[9], "shard-9.tar");
    }

    #[test]
    fn padded_range_keeps_width() {
        let t = Template::parse("obj-{000..010}").unwrap();
        let names: Vec<_> = t.iter().collect();
        assert_eq!(names[0], "obj-000");
        assert_eq!(names[10], "obj-010");
    }

    #[test]
    fn cartesian_product_orders_last_range_fastest() {
        let t = Template::parse("{0..1}-{0..2}").unwrap();
        let names: Vec<_> = t.iter().collect();
        assert_eq!(names, ["0-0", "0-1", "0-2", "1-0", "1-1", "1-2"]);
    }

    #[test]
    fn matches_agrees_with_expansion() {
        let t = Template::parse("shard-{7..12}.tar").unwrap();
        for name in t.iter() {
            assert!(t.matches(&name), "{name}");
        }
        assert!(!t.matches("shard-6.tar"));
        assert!(!t.matches("shard-13.tar"));
        assert!(!t.matches("shard-7.tgz"));
    }

    #[test]
    fn plain_names_are_valid_templates() {
        let t = Template::parse("just-a-name").unwrap();
        assert_eq!(t.count(), 1);
        assert!(t.matches("just-a-name"));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(Template::parse("a{1..").is_err());
        assert!(Template::parse("a{1-2}").is_err());
        assert!(Template::parse("a{9..1}").is_err());
    }
}
