use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::model::BookId;

#[derive(Debug, PartialEq, Clone)]
pub enum Condition {
    Id(BookId),
    TitleLike(String),
    MinStock(i64),
}

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Insert { id: BookId, title: String, stock: i64 },
    Select { filter: Vec<Condition>, as_of: Option<u64> },
    Update { id: BookId, title: Option<String>, stock: Option<i64> },
    Delete { id: BookId },
    Get { id: BookId },
    History { id: Option<BookId> },
    Checkpoint,
    Verify,
    Help,
    Exit,
}

enum Assignment {
    Title(String),
    Stock(i64),
}

// --- BASIC PARSERS ---

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i64>())(input)
}

fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

fn parse_id_eq(input: &str) -> IResult<&str, BookId> {
    preceded(tuple((ws(tag_ci("ID")), ws(char('=')))), parse_i64)(input)
}

fn parse_condition(input: &str) -> IResult<&str, Condition> {
    alt((
        map(parse_id_eq, Condition::Id),
        map(
            preceded(tuple((ws(tag_ci("TITLE")), ws(tag_ci("LIKE")))), parse_quoted_string),
            Condition::TitleLike,
        ),
        map(
            preceded(tuple((ws(tag_ci("STOCK")), ws(tag(">=")))), parse_i64),
            Condition::MinStock,
        ),
    ))(input)
}

fn parse_assignment(input: &str) -> IResult<&str, Assignment> {
    alt((
        map(
            preceded(tuple((ws(tag_ci("TITLE")), ws(char('=')))), parse_quoted_string),
            Assignment::Title,
        ),
        map(
            preceded(tuple((ws(tag_ci("STOCK")), ws(char('=')))), parse_i64),
            Assignment::Stock,
        ),
    ))(input)
}

// --- COMMAND PARSERS ---

fn parse_insert(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("INSERT")(input)?;
    let (input, _) = opt(tuple((ws(tag_ci("INTO")), ws(tag_ci("BOOKS")))))(input)?;
    let (input, _) = opt(ws(tag_ci("VALUES")))(input)?;

    let (input, _) = ws(char('('))(input)?;
    let (input, id) = parse_i64(input)?;
    let (input, _) = ws(char(','))(input)?;
    let (input, title) = parse_quoted_string(input)?;
    let (input, stock) = opt(preceded(ws(char(',')), parse_i64))(input)?;
    let (input, _) = ws(char(')'))(input)?;

    Ok((input, Command::Insert { id, title, stock: stock.unwrap_or(0) }))
}

fn parse_select(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("SELECT"), tag_ci("FIND")))(input)?;
    let (input, _) = opt(ws(char('*')))(input)?;
    let (input, _) = ws(tag_ci("FROM"))(input)?;
    let (input, _) = ws(tag_ci("BOOKS"))(input)?;

    let (input, filter) = opt(preceded(
        ws(tag_ci("WHERE")),
        separated_list1(ws(tag_ci("AND")), parse_condition),
    ))(input)?;

    let (input, as_of) = opt(preceded(
        tuple((ws(tag_ci("AS")), ws(tag_ci("OF")))),
        parse_u64,
    ))(input)?;

    Ok((input, Command::Select { filter: filter.unwrap_or_default(), as_of }))
}

fn parse_update(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("UPDATE")(input)?;
    let (input, _) = opt(ws(tag_ci("BOOKS")))(input)?;
    let (input, _) = ws(tag_ci("SET"))(input)?;
    let (input, assignments) = separated_list1(ws(char(',')), parse_assignment)(input)?;
    let (input, _) = ws(tag_ci("WHERE"))(input)?;
    let (input, id) = parse_id_eq(input)?;

    let mut title = None;
    let mut stock = None;
    for a in assignments {
        match a {
            Assignment::Title(t) => title = Some(t),
            Assignment::Stock(s) => stock = Some(s),
        }
    }
    Ok((input, Command::Update { id, title, stock }))
}

fn parse_delete(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("DELETE")(input)?;
    let (input, _) = opt(tuple((ws(tag_ci("FROM")), ws(tag_ci("BOOKS")))))(input)?;
    let (input, _) = ws(tag_ci("WHERE"))(input)?;
    let (input, id) = parse_id_eq(input)?;
    Ok((input, Command::Delete { id }))
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("GET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, id) = parse_i64(input)?;
    Ok((input, Command::Get { id }))
}

fn parse_history(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HISTORY")(input)?;
    let (input, id) = opt(preceded(multispace1, parse_i64))(input)?;
    Ok((input, Command::History { id }))
}

fn parse_keyword(input: &str) -> IResult<&str, Command> {
    alt((
        map(tag_ci("CHECKPOINT"), |_| Command::Checkpoint),
        map(tag_ci("VERIFY"), |_| Command::Verify),
        map(tag_ci("HELP"), |_| Command::Help),
        map(alt((tag_ci("EXIT"), tag_ci("QUIT"))), |_| Command::Exit),
    ))(input)
}

// ID lookups and time travel go to single-row routes that take no other filter.
fn check_select(cmd: &Command) -> Result<(), String> {
    if let Command::Select { filter, .. } = cmd {
        let by_id = filter.iter().any(|c| matches!(c, Condition::Id(_)));
        if by_id && filter.len() > 1 {
            return Err("'ID = ...' cannot be combined with other conditions".to_string());
        }
    }
    Ok(())
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_insert,
        parse_select,
        parse_update,
        parse_delete,
        parse_get,
        parse_history,
        parse_keyword,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            check_select(&cmd)?;
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            // e.input contains the slice where parsing failed
            let context: String = e.input.chars().take(20).collect();
            if context.len() < e.input.len() {
                Err(format!("Invalid syntax near: '{}...'", context))
            } else {
                Err(format!("Invalid syntax near: '{}'", context))
            }
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}
