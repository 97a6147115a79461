use crate::json::JsonValue;

/// A position in the source text. Lines and columns are 1-based, the
/// character offset is 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
    pub offset: usize,
}

impl Pos {
    pub fn start() -> Pos {
        Pos {
            line: 1,
            col: 1,
            offset: 0,
        }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A from/to source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub from: Pos,
    pub to: Pos,
}

impl Span {
    pub fn new(from: Pos, to: Pos) -> Span {
        Span { from, to }
    }

    pub fn at(pos: Pos) -> Span {
        Span { from: pos, to: pos }
    }

    /// The smallest span covering both inputs.
    pub fn union(self, other: Span) -> Span {
        let from = if self.from.offset <= other.from.offset {
            self.from
        } else {
            other.from
        };
        let to = if self.to.offset >= other.to.offset {
            self.to
        } else {
            other.to
        };
        Span { from, to }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}..{}", self.from, self.to)
        }
    }
}

macro_rules! token_types {
    ($($name:ident => $err:expr),+ $(,)?) => {
        /// Terminal symbols of the grammar.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum TokenType {
            $($name),+
        }

        impl TokenType {
            pub const ALL: &'static [TokenType] = &[$(TokenType::$name),+];
            pub const COUNT: usize = Self::ALL.len();

            /// Human-readable name used in "expected ..." diagnostics.
            pub fn error_name(self) -> &'static str {
                match self {
                    $(TokenType::$name => $err),+
                }
            }

            #[inline]
            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

token_types! {
    Boolean => "boolean",
    Identifier => "identifier",
    Number => "number",

    ParenOpen => "'('",
    ParenClose => "')'",
    BracketOpen => "'['",
    BracketClose => "']'",
    BraceOpen => "'{'",
    BraceClose => "'}'",
    Comma => "','",
    Colon => "':'",
    Plus => "'+'",
    Dash => "'-'",
    Star => "'*'",
    Slash => "'/'",
    Percent => "'%'",
    Period => "'.'",
    DoublePeriod => "'..'",
    TriplePeriod => "'...'",
    Excl => "'!'",
    Tilde => "'~'",
    Hash => "'#'",
    Lsh => "'<<'",
    Rsh => "'>>'",
    Rrsh => "'>>>'",
    LessThan => "'<'",
    GreaterThan => "'>'",
    LessEqual => "'<='",
    GreaterEqual => "'>='",
    Equal => "'=='",
    Inequal => "'!='",
    And => "'&'",
    Or => "'|'",
    Xor => "'^'",
    And2 => "'&&'",
    Or2 => "'||'",
    Question => "'?'",
    At => "'@'",
    Plus2 => "'++'",
    Minus2 => "'--'",
    Assign => "'='",
    PlusIs => "'+='",
    MinusIs => "'-='",
    StarIs => "'*='",
    SlashIs => "'/='",
    PercentIs => "'%='",
    LshIs => "'<<='",
    RshIs => "'>>='",
    RrshIs => "'>>>='",
    AndIs => "'&='",
    OrIs => "'|='",
    XorIs => "'^='",
    Arrow => "'->'",

    Underscore => "'_'",
    Dollar => "'$'",
    Null => "'null'",
    Copy => "'copy'",
    Is => "'is'",
    Isnt => "'isnt'",
    Has => "'has'",
    Hasnt => "'hasnt'",
    If => "'if'",
    Else => "'else'",
    For => "'for'",
    In => "'in'",
    From => "'from'",
    To => "'to'",
    Switch => "'switch'",
    Match => "'match'",
    Case => "'case'",
    Do => "'do'",
    Then => "'then'",
    Def => "'def'",
    Gen => "'gen'",
    Break => "'break'",
    Continue => "'continue'",
    Return => "'return'",

    PureString => "string",
    DqDelimiter => "string delimiter",
    MlDelimiter => "string delimiter",
    DqMlDelimiter => "string delimiter",
    StringContent => "string content",
    Interpolation => "'#['",
    MlWhitespace => "whitespace",
    MlLineBreak => "line break",
    MlBoundaryIndicator => "'\\'",
    MlNoLineBreak => "'\\~'",

    Eof => "end of input",
}

/// One lexed token: its type, an optional literal payload (numbers, strings,
/// booleans, identifier names) and the source range it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub ty: TokenType,
    pub value: Option<JsonValue>,
    pub span: Span,
}

impl Token {
    pub fn new(ty: TokenType, span: Span) -> Token {
        Token {
            ty,
            value: None,
            span,
        }
    }

    pub fn with_value(ty: TokenType, value: JsonValue, span: Span) -> Token {
        Token {
            ty,
            value: Some(value),
            span,
        }
    }

    /// Literal payload as a string; identifiers and string fragments carry one.
    pub fn text(&self) -> &str {
        match &self.value {
            Some(JsonValue::Str(s)) => s.as_ref(),
            _ => "",
        }
    }
}
