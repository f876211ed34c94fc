//! Textual CacheIR parser.
//!
//! Parses the listing produced by `CacheIRWriter`'s `Display` impl back into
//! a writer. Two passes: parse text → AST, then re-emit every instruction
//! through the writer so operand last-use information is rebuilt.

use std::collections::{BTreeSet, HashMap};

use chumsky::prelude::*;

use crate::cacheir::{ArgKind, CacheIRArg, CacheIRWriter, CacheKind, CacheOp, OperandId, check_args};
use crate::runtime::ClassKind;
use crate::stub_data::{StubField, StubFieldType};

// ─── AST types (first pass) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum AstArg {
    /// `%3`
    Operand(u16),
    /// `#1`
    Field(u32),
    /// `true`, `false`
    Bool(bool),
    /// `-7`
    Int(i64),
    /// `Array` and other class names
    Name(String),
}

#[derive(Debug, Clone)]
struct AstInstr {
    def: Option<u16>,
    op: String,
    args: Vec<AstArg>,
}

#[derive(Debug, Clone)]
struct AstField {
    index: u32,
    ty: String,
    word: u64,
}

#[derive(Debug, Clone)]
struct AstProgram {
    kind: String,
    inputs: Vec<u16>,
    instrs: Vec<AstInstr>,
    fields: Vec<AstField>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Horizontal whitespace only; instructions end at a newline.
fn hs<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| *c == ' ' || *c == '\t')
        .repeated()
        .ignored()
}

/// One or more line ends, blank lines included.
fn line_end<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    hs().then(text::newline()).repeated().at_least(1).ignored()
}

fn uint16<'src>() -> impl Parser<'src, &'src str, u16, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).try_map(|s: &str, span| {
        s.parse::<u16>()
            .map_err(|e| Rich::custom(span, format!("bad operand id {s}: {e}")))
    })
}

fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).try_map(|s: &str, span| {
        s.parse::<u32>()
            .map_err(|e| Rich::custom(span, format!("bad index {s}: {e}")))
    })
}

fn hex64<'src>() -> impl Parser<'src, &'src str, u64, Extra<'src>> + Clone {
    just("0x")
        .ignore_then(text::int::<_, Extra<'_>>(16))
        .try_map(|s: &str, span| {
            u64::from_str_radix(s, 16)
                .map_err(|e| Rich::custom(span, format!("bad hex word {s}: {e}")))
        })
}

fn signed_int<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just('-')
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<i64>()
                .map_err(|e| Rich::custom(span, format!("bad integer {s}: {e}")))
        })
}

fn operand<'src>() -> impl Parser<'src, &'src str, u16, Extra<'src>> + Clone {
    just('%').ignore_then(uint16())
}

fn arg<'src>() -> impl Parser<'src, &'src str, AstArg, Extra<'src>> + Clone {
    choice((
        operand().map(AstArg::Operand),
        just('#').ignore_then(uint32()).map(AstArg::Field),
        just("true").to(AstArg::Bool(true)),
        just("false").to(AstArg::Bool(false)),
        signed_int().map(AstArg::Int),
        text::ident::<_, Extra<'_>>().map(|s: &str| AstArg::Name(s.to_string())),
    ))
}

fn instr<'src>() -> impl Parser<'src, &'src str, AstInstr, Extra<'src>> + Clone {
    let def = operand().then_ignore(hs().then(just('=')).then(hs()));
    let op_name = text::ident::<_, Extra<'_>>().filter(|s: &&str| *s != "fields");
    let args = arg()
        .separated_by(just(',').padded_by(hs()))
        .collect::<Vec<_>>();

    def.or_not()
        .then(op_name)
        .then(hs().ignore_then(args))
        .map(|((def, op), args)| AstInstr {
            def,
            op: op.to_string(),
            args,
        })
}

fn field_decl<'src>() -> impl Parser<'src, &'src str, AstField, Extra<'src>> + Clone {
    just('#')
        .ignore_then(uint32())
        .then_ignore(hs())
        .then(text::ident::<_, Extra<'_>>())
        .then_ignore(hs())
        .then(hex64())
        .map(|((index, ty), word)| AstField {
            index,
            ty: ty.to_string(),
            word,
        })
}

fn header<'src>() -> impl Parser<'src, &'src str, (String, Vec<u16>), Extra<'src>> + Clone {
    text::ident::<_, Extra<'_>>()
        .then_ignore(just('(').then(hs()))
        .then(
            operand()
                .separated_by(just(',').padded_by(hs()))
                .collect::<Vec<_>>(),
        )
        .then_ignore(hs().then(just(')')))
        .map(|(kind, inputs): (&str, Vec<u16>)| (kind.to_string(), inputs))
}

fn program<'src>() -> impl Parser<'src, &'src str, AstProgram, Extra<'src>> + Clone {
    let instrs = line_end()
        .ignore_then(hs())
        .ignore_then(instr())
        .repeated()
        .collect::<Vec<_>>();

    let fields = line_end()
        .ignore_then(hs())
        .ignore_then(just("fields:"))
        .ignore_then(
            line_end()
                .ignore_then(hs())
                .ignore_then(field_decl())
                .repeated()
                .collect::<Vec<_>>(),
        )
        .or_not()
        .map(Option::unwrap_or_default);

    ws().ignore_then(header())
        .then(instrs)
        .then(fields)
        .then_ignore(ws())
        .then_ignore(end())
        .map(|(((kind, inputs), instrs), fields)| AstProgram {
            kind,
            inputs,
            instrs,
            fields,
        })
}

// ─── Resolution (second pass) ──────────────────────────────────────────────

/// Parse error with context.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

/// Parse a CacheIR listing into a writer holding the same program and
/// stub fields.
pub fn parse_cacheir(input: &str) -> Result<CacheIRWriter, ParseError> {
    let ast = program().parse(input).into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        ParseError::new(msgs.join("\n"))
    })?;
    resolve(ast)
}

/// Largest operand id or field index the byte encoding can hold.
const MAX_INDEX: usize = u8::MAX as usize;

fn resolve(ast: AstProgram) -> Result<CacheIRWriter, ParseError> {
    let kind = CacheKind::from_name(&ast.kind)
        .ok_or_else(|| ParseError::new(format!("unknown cache kind {}", ast.kind)))?;
    let expected: Vec<u16> = (0..kind.num_inputs() as u16).collect();
    if ast.inputs != expected {
        return Err(ParseError::new(format!(
            "{kind} takes {} input(s) numbered from %0",
            kind.num_inputs()
        )));
    }

    let mut fields: HashMap<u32, StubField> = HashMap::new();
    for decl in &ast.fields {
        let ty = StubFieldType::from_name(&decl.ty)
            .ok_or_else(|| ParseError::new(format!("unknown field type {}", decl.ty)))?;
        let field = StubField::from_word(ty, decl.word)
            .ok_or_else(|| ParseError::new(format!("#{} cannot have type {ty}", decl.index)))?;
        if fields.insert(decl.index, field).is_some() {
            return Err(ParseError::new(format!("field #{} declared twice", decl.index)));
        }
    }

    let mut writer = CacheIRWriter::new(kind);
    let mut referenced = BTreeSet::new();
    for (line, instr) in ast.instrs.iter().enumerate() {
        let op = CacheOp::from_name(&instr.op)
            .ok_or_else(|| ParseError::new(format!("unknown op {}", instr.op)))?;
        let schema = op.args().iter().filter(|&&a| a != ArgKind::Def);
        if instr.args.len() != schema.clone().count() {
            return Err(ParseError::new(format!(
                "instruction {line}: {op} takes {} argument(s), got {}",
                schema.count(),
                instr.args.len()
            )));
        }

        let mut args = Vec::with_capacity(instr.args.len());
        for (kind, arg) in schema.zip(&instr.args) {
            args.push(resolve_arg(&writer, &fields, line, *kind, arg)?);
        }
        check_args(op, &args).map_err(|msg| ParseError::new(format!("instruction {line}: {msg}")))?;

        // Operand ids and field indices are one byte in the encoding.
        if op.num_defs() > 0 && writer.num_operand_ids() > MAX_INDEX {
            return Err(ParseError::new(format!(
                "instruction {line}: too many operands (at most {})",
                MAX_INDEX + 1
            )));
        }
        let new_fields = args.iter().filter(|a| matches!(a, CacheIRArg::Field(_))).count();
        if writer.num_stub_fields() + new_fields > MAX_INDEX + 1 {
            return Err(ParseError::new(format!(
                "instruction {line}: too many stub fields (at most {})",
                MAX_INDEX + 1
            )));
        }
        referenced.extend(instr.args.iter().filter_map(|arg| match arg {
            AstArg::Field(index) => Some(*index),
            _ => None,
        }));

        let defined = writer.emit(op, &args);
        match (instr.def, defined) {
            (None, None) => {}
            (Some(want), Some(got)) if OperandId(want) == got => {}
            (Some(want), Some(got)) => {
                return Err(ParseError::new(format!(
                    "instruction {line}: defines %{want} but the next operand is {got}"
                )));
            }
            (Some(want), None) => {
                return Err(ParseError::new(format!(
                    "instruction {line}: {op} does not define %{want}"
                )));
            }
            (None, Some(got)) => {
                return Err(ParseError::new(format!(
                    "instruction {line}: {op} defines {got}; write `{got} = {op} ...`"
                )));
            }
        }
    }

    // Fields no instruction references follow in declared order.
    let mut rest: Vec<_> = fields
        .iter()
        .filter(|(index, _)| !referenced.contains(*index))
        .map(|(index, field)| (*index, *field))
        .collect();
    if writer.num_stub_fields() + rest.len() > MAX_INDEX + 1 {
        return Err(ParseError::new(format!(
            "too many stub fields (at most {})",
            MAX_INDEX + 1
        )));
    }
    rest.sort_by_key(|(index, _)| *index);
    for (_, field) in rest {
        writer.add_stub_field(field);
    }

    Ok(writer)
}

fn resolve_arg(
    writer: &CacheIRWriter,
    fields: &HashMap<u32, StubField>,
    line: usize,
    kind: ArgKind,
    arg: &AstArg,
) -> Result<CacheIRArg, ParseError> {
    let mismatch = || ParseError::new(format!("instruction {line}: expected {kind:?}, got {arg:?}"));
    Ok(match (kind, arg) {
        (ArgKind::Use, AstArg::Operand(id)) => {
            if *id as usize >= writer.num_operand_ids() {
                return Err(ParseError::new(format!("instruction {line}: %{id} is not defined")));
            }
            CacheIRArg::Operand(OperandId(*id))
        }
        (ArgKind::Field(_), AstArg::Field(index)) => {
            let field = fields
                .get(index)
                .ok_or_else(|| ParseError::new(format!("instruction {line}: #{index} is not declared")))?;
            CacheIRArg::Field(*field)
        }
        (ArgKind::Class, AstArg::Name(name)) => CacheIRArg::Class(
            ClassKind::from_name(name)
                .ok_or_else(|| ParseError::new(format!("instruction {line}: unknown class {name}")))?,
        ),
        (ArgKind::Bool, AstArg::Bool(b)) => CacheIRArg::Bool(*b),
        (ArgKind::Int32, AstArg::Int(i)) => CacheIRArg::Int32(
            i32::try_from(*i)
                .map_err(|_| ParseError::new(format!("instruction {line}: {i} does not fit in int32")))?,
        ),
        _ => return Err(mismatch()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Shape;
    use crate::value::Value;

    #[test]
    fn parse_guard_and_load() {
        let input = r#"
GetProp(%0)
  GuardIsObject %0
  GuardShape %0, #0
  LoadFixedSlotResult %0, #1
  ReturnFromIC
fields:
  #0 Shape 0x1000
  #1 RawWord 0x28
"#;
        let writer = parse_cacheir(input).unwrap();
        assert_eq!(writer.kind(), CacheKind::GetProp);
        assert_eq!(writer.num_instructions(), 4);
        assert_eq!(
            writer.stub_fields(),
            &[
                StubField::Shape(0x1000 as *const Shape),
                StubField::RawWord(0x28)
            ]
        );
        assert_eq!(writer.operand_last_used(OperandId(0)), 2);
    }

    #[test]
    fn round_trip_display() {
        let mut w = CacheIRWriter::new(CacheKind::BinaryArith);
        let lhs = w.guard_is_int32(w.input_operand(0));
        let rhs = w.guard_is_int32(w.input_operand(1));
        w.int32_add_result(lhs, rhs);
        w.return_from_ic();
        let mut w2 = CacheIRWriter::new(CacheKind::GetElem);
        let obj = w2.guard_is_array(w2.input_operand(0));
        let slot = w2.load_dynamic_slot(obj, 16);
        w2.guard_is_number(slot);
        w2.load_int32_constant(-3);
        w2.load_boolean_result(false);
        w2.load_value_result(Value::from_int32(9));
        w2.load_undefined_result();
        w2.return_from_ic();

        for w in [w, w2] {
            let text1 = w.to_string();
            let parsed = parse_cacheir(&text1).unwrap();
            let text2 = parsed.to_string();
            assert_eq!(text1, text2, "round trip failed:\n--- original ---\n{text1}\n--- reparsed ---\n{text2}");
            assert_eq!(w.code(), parsed.code());
            assert_eq!(w.stub_fields(), parsed.stub_fields());
        }
    }

    #[test]
    fn parse_error_wrong_field_type() {
        let input = "GetProp(%0)\n  GuardShape %0, #0\nfields:\n  #0 RawWord 0x8\n";
        let err = parse_cacheir(input).unwrap_err();
        assert!(err.message.contains("argument 1"), "error was: {}", err.message);
    }

    #[test]
    fn parse_error_undefined_operand() {
        let input = "GetProp(%0)\n  LoadOperandResult %4\n  ReturnFromIC\n";
        let err = parse_cacheir(input).unwrap_err();
        assert!(err.message.contains("%4 is not defined"), "error was: {}", err.message);
    }

    #[test]
    fn parse_error_def_numbering() {
        let input = "GetProp(%0)\n  %5 = LoadInt32Constant 1\n";
        let err = parse_cacheir(input).unwrap_err();
        assert!(err.message.contains("next operand is %1"), "error was: {}", err.message);
    }

    #[test]
    fn parse_unreferenced_fields_keep_their_values() {
        let input = "GetProp(%0)\n  LoadValueResult #2\n  ReturnFromIC\nfields:\n  #0 RawWord 0x11\n  #1 RawWord 0x22\n  #2 Value 0x33\n";
        let writer = parse_cacheir(input).unwrap();
        assert_eq!(
            writer.stub_fields(),
            &[
                StubField::Value(Value::from_bits(0x33)),
                StubField::RawWord(0x11),
                StubField::RawWord(0x22),
            ]
        );
    }

    #[test]
    fn parse_fields_referenced_out_of_order() {
        let input = r#"
GetProp(%0)
  GuardIsObject %0
  GuardShape %0, #1
  LoadFixedSlotResult %0, #0
  ReturnFromIC
fields:
  #0 RawWord 0x28
  #1 Shape 0x1000
  #2 RawInt64 0x7
"#;
        let writer = parse_cacheir(input).unwrap();
        assert_eq!(
            writer.stub_fields(),
            &[
                StubField::Shape(0x1000 as *const Shape),
                StubField::RawWord(0x28),
                StubField::RawInt64(0x7),
            ]
        );
    }

    #[test]
    fn parse_error_too_many_operands() {
        let mut input = String::from("GetProp(%0)\n");
        for i in 1..=300 {
            input.push_str(&format!("  %{i} = LoadInt32Constant 1\n"));
        }
        input.push_str("  ReturnFromIC\n");
        let err = parse_cacheir(&input).unwrap_err();
        assert!(err.message.contains("too many operands"), "error was: {}", err.message);
    }

    #[test]
    fn parse_error_too_many_fields() {
        let mut input = String::from("GetProp(%0)\n");
        for _ in 0..257 {
            input.push_str("  LoadValueResult #0\n");
        }
        input.push_str("  ReturnFromIC\nfields:\n  #0 Value 0x1\n");
        let err = parse_cacheir(&input).unwrap_err();
        assert!(err.message.contains("too many stub fields"), "error was: {}", err.message);
    }

    #[test]
    fn parse_error_malformed() {
        assert!(parse_cacheir("this is not CacheIR at all").is_err());
    }
}
