//! Expression evaluator used by the simulated runtime
//!
//! Supports integer and string literals, `nil`/`true`/`false`, local and
//! instance variable lookup, arithmetic `+ -`, comparisons, `! && ||` and
//! parentheses. Enough to drive breakpoint conditions, watches and `p`.

use super::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    const OPS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "!"];

    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse()
                .map_err(|_| format!("integer literal out of range: {}", text))?;
            tokens.push(Token::Int(n));
        } else if c == '"' || c == '\'' {
            let quote = c;
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated string literal".to_string());
            }
            tokens.push(Token::Str(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_alphabetic() || c == '_' || c == '@' || c == '$' {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '?')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else {
            let rest: String = chars[i..].iter().take(2).collect();
            let op = OPS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| format!("syntax error, unexpected '{}'", c))?;
            tokens.push(Token::Op(op));
            i += op.len();
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    lookup: &'a dyn Fn(&str) -> Option<Value>,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn or(&mut self) -> Result<Value, String> {
        let mut left = self.and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.and()?;
            left = if left.is_truthy() { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut left = self.comparison()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.comparison()?;
            left = if left.is_truthy() { right } else { left };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let left = self.additive()?;
        let Some(op) = self.peek_op() else {
            return Ok(left);
        };
        if !matches!(op, "==" | "!=" | "<" | ">" | "<=" | ">=") {
            return Ok(left);
        }
        self.pos += 1;
        let right = self.additive()?;

        let result = match op {
            "==" => left.class_name == right.class_name && left.repr == right.repr,
            "!=" => !(left.class_name == right.class_name && left.repr == right.repr),
            _ => {
                let (a, b) = (as_int(&left)?, as_int(&right)?);
                match op {
                    "<" => a < b,
                    ">" => a > b,
                    "<=" => a <= b,
                    _ => a >= b,
                }
            }
        };
        Ok(Value::boolean(result))
    }

    fn additive(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        while let Some(op @ ("+" | "-")) = self.peek_op() {
            self.pos += 1;
            let right = self.unary()?;
            left = if op == "+" && left.class_name == "String" {
                let joined = format!("{}{}", unquote(&left.repr), unquote(&right.repr));
                string(&joined)
            } else {
                let (a, b) = (as_int(&left)?, as_int(&right)?);
                integer(if op == "+" { a + b } else { a - b })
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                let v = self.unary()?;
                Ok(Value::boolean(!v.is_truthy()))
            }
            Some("-") => {
                self.pos += 1;
                let v = self.unary()?;
                Ok(integer(-as_int(&v)?))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Value, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "syntax error, unexpected end-of-input".to_string())?;
        self.pos += 1;

        match token {
            Token::Int(n) => Ok(integer(n)),
            Token::Str(s) => Ok(string(&s)),
            Token::Ident(name) => match name.as_str() {
                "nil" => Ok(Value::nil()),
                "true" => Ok(Value::boolean(true)),
                "false" => Ok(Value::boolean(false)),
                _ => (self.lookup)(&name).ok_or_else(|| {
                    if name.starts_with('@') {
                        return "nil".to_string();
                    }
                    format!("undefined local variable or method `{}'", name)
                }),
            }
            .or_else(|e| if e == "nil" { Ok(Value::nil()) } else { Err(e) }),
            Token::LParen => {
                let v = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => Err("syntax error, expected ')'".to_string()),
                }
            }
            Token::RParen => Err("syntax error, unexpected ')'".to_string()),
            Token::Op(op) => Err(format!("syntax error, unexpected '{}'", op)),
        }
    }
}

fn as_int(v: &Value) -> Result<i64, String> {
    if v.class_name != "Integer" {
        return Err(format!("undefined method for {}", v.class_name));
    }
    v.repr
        .parse()
        .map_err(|_| format!("invalid Integer: {}", v.repr))
}

fn unquote(repr: &str) -> &str {
    repr.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(repr)
}

/// Build an Integer value
pub fn integer(n: i64) -> Value {
    let mut v = Value::new("Integer", &n.to_string());
    v.ancestors = vec!["Integer".into(), "Numeric".into(), "Object".into()];
    v
}

/// Build a String value
pub fn string(s: &str) -> Value {
    let mut v = Value::new("String", &format!("{:?}", s));
    v.ancestors = vec!["String".into(), "Object".into()];
    v
}

/// Split `name = expr` into its target and right-hand side
pub fn split_assignment(src: &str) -> Option<(&str, &str)> {
    let idx = src.find('=')?;
    let (lhs, rhs) = (src[..idx].trim(), &src[idx + 1..]);
    if rhs.starts_with('=') || lhs.ends_with(['!', '<', '>']) {
        return None;
    }
    let valid = !lhs.is_empty()
        && lhs
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_alphanumeric() || c == '_' || (i == 0 && c == '@'));
    valid.then_some((lhs, rhs.trim()))
}

/// Evaluate an expression against a variable lookup
pub fn evaluate(src: &str, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<Value, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("syntax error, unexpected end-of-input".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        lookup,
    };
    let value = parser.or()?;
    if parser.pos != parser.tokens.len() {
        return Err("syntax error, unexpected trailing input".to_string());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Result<Value, String> {
        evaluate(src, &|name| match name {
            "x" => Some(integer(10)),
            "@name" => Some(string("bob")),
            _ => None,
        })
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("x + 5").unwrap().repr, "15");
        assert_eq!(eval("x - 15").unwrap().repr, "-5");
        assert!(eval("x > 3 && x < 11").unwrap().is_truthy());
        assert!(!eval("(x == 3) || false").unwrap().is_truthy());
        assert!(eval("!(x != 10)").unwrap().is_truthy());
    }

    #[test]
    fn test_strings_and_ivars() {
        assert_eq!(eval("@name").unwrap().repr, "\"bob\"");
        assert_eq!(eval("@name + '!'").unwrap().repr, "\"bob!\"");
        assert!(eval("@name == \"bob\"").unwrap().is_truthy());
        assert_eq!(eval("@missing").unwrap(), Value::nil());
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            eval("y").unwrap_err(),
            "undefined local variable or method `y'"
        );
        assert!(eval("x +").is_err());
        assert!(eval("(x").is_err());
        assert!(eval("x 1").is_err());
        assert!(eval("\"abc").is_err());
    }

    #[test]
    fn test_split_assignment() {
        assert_eq!(split_assignment("x = 1 + 2"), Some(("x", "1 + 2")));
        assert_eq!(split_assignment("@a=3"), Some(("@a", "3")));
        assert_eq!(split_assignment("x == 1"), None);
        assert_eq!(split_assignment("x != 1"), None);
        assert_eq!(split_assignment("x <= 1"), None);
    }
}
