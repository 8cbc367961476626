//! The GraphQL error object model shared by both frame directions, and
//! classification of request documents into one-shot vs. streaming
//! operations.

use derive_more::Display;
use graphql_parser::query::{Definition, OperationDefinition, parse_query};
use serde::{Deserialize, Serialize};

/// A single GraphQL error object as it appears on the wire.
///
/// Optional members are omitted from the encoding when absent.
#[derive(Clone, Debug, Deserialize, Display, PartialEq, Serialize)]
#[display("{message}")]
pub struct GraphQLError {
    /// A description of the error intended for the developer.
    pub message: String,

    /// Positions in the request document the error relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,

    /// The path to the response field the error is associated with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,

    /// Implementation-defined additional information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQLError {
    /// Creates an error carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

/// A source position inside a request document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Location {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

/// The kind of the operation selected from a request document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    /// A one-shot read.
    Query,
    /// A one-shot write.
    Mutation,
    /// A streaming operation producing zero or more events.
    Subscription,
}

impl OperationKind {
    /// Whether operations of this kind produce an event stream.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Subscription)
    }
}

/// Parses `query` and returns the kind of the operation that would execute.
///
/// The operation is selected by `operation_name`; without one, the first
/// operation in the document is taken. Parse failures and unresolvable names
/// are reported as a [`GraphQLError`] suitable for an `error` frame.
pub fn classify(query: &str, operation_name: Option<&str>) -> Result<OperationKind, GraphQLError> {
    let document = parse_query::<&str>(query)
        .map_err(|e| GraphQLError::new(format!("Invalid query: {e}")))?;

    let mut operations = document.definitions.iter().filter_map(|d| match d {
        Definition::Operation(op) => Some(op),
        Definition::Fragment(_) => None,
    });

    let selected = match operation_name {
        Some(name) => operations
            .find(|op| name_of(op) == Some(name))
            .ok_or_else(|| GraphQLError::new(format!("Unknown operation \"{name}\"")))?,
        None => operations
            .next()
            .ok_or_else(|| GraphQLError::new("Document contains no operations"))?,
    };

    Ok(match selected {
        OperationDefinition::SelectionSet(_) | OperationDefinition::Query(_) => {
            OperationKind::Query
        }
        OperationDefinition::Mutation(_) => OperationKind::Mutation,
        OperationDefinition::Subscription(_) => OperationKind::Subscription,
    })
}

fn name_of<'a>(op: &'a OperationDefinition<'a, &'a str>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name,
        OperationDefinition::Mutation(m) => m.name,
        OperationDefinition::Subscription(s) => s.name,
    }
}
