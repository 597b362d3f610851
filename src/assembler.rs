use crate::{config::Config, parser::Event, part::PartHead, Error, FormFieldPart};
use bytes::{Bytes, BytesMut};

/// Output of feeding one parser event to the assembler.
#[derive(Debug)]
pub(crate) enum Assembled {
    Incomplete,
    Field(FormFieldPart),
    File(PartHead),
    FileChunk(Bytes),
    FileEnd,
    End,
}

#[derive(Debug)]
enum Stage {
    Boundary,
    Headers { lines: Vec<Vec<u8>>, size: usize },
    Field { head: PartHead, value: BytesMut },
    File,
    Finished,
}

impl Stage {
    fn describe(&self) -> &'static str {
        match self {
            Stage::Boundary => "waiting for a part",
            Stage::Headers { .. } => "reading part headers",
            Stage::Field { .. } => "reading a field",
            Stage::File => "reading a file",
            Stage::Finished => "finished",
        }
    }
}

/// Turns the flat event sequence of one message into parts.
///
/// Fields are materialized; file bodies are passed through chunk by chunk.
#[derive(Debug)]
pub(crate) struct PartAssembler {
    stage: Stage,
    parts: usize,
    max_header_bytes: usize,
    max_field_bytes: usize,
    max_parts: Option<usize>,
}

impl PartAssembler {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            stage: Stage::Boundary,
            parts: 0,
            max_header_bytes: config.max_header_bytes,
            max_field_bytes: config.max_field_bytes,
            max_parts: config.max_parts,
        }
    }

    pub(crate) fn push(&mut self, event: Event) -> Result<Assembled, Error> {
        let stage = std::mem::replace(&mut self.stage, Stage::Finished);

        let (next, out) = match (stage, event) {
            (Stage::Boundary, Event::PartStart) => {
                self.parts += 1;
                if let Some(max) = self.max_parts {
                    if self.parts > max {
                        return Err(Error::TooManyParts(max));
                    }
                }
                let lines = Vec::new();
                (Stage::Headers { lines, size: 0 }, Assembled::Incomplete)
            }

            (Stage::Boundary, Event::MessageEnd) => (Stage::Finished, Assembled::End),

            (Stage::Headers { mut lines, size }, Event::HeaderLine(line)) => {
                let size = size + line.len() + 2;
                if size > self.max_header_bytes {
                    return Err(Error::HeadersTooLarge(self.max_header_bytes));
                }

                let folded = matches!(line.first(), Some(b' ') | Some(b'\t'));
                match lines.last_mut() {
                    Some(prev) if folded => prev.extend_from_slice(&line),
                    _ => lines.push(line.to_vec()),
                }
                (Stage::Headers { lines, size }, Assembled::Incomplete)
            }

            (Stage::Headers { lines, .. }, Event::HeadersEnd) => {
                let head = PartHead::from_lines(&lines)?;
                if head.filename.is_some() {
                    log::debug!("File part {:?} ({:?})", head.name, head.filename);
                    (Stage::File, Assembled::File(head))
                } else {
                    log::debug!("Field part {:?}", head.name);
                    let value = BytesMut::new();
                    (Stage::Field { head, value }, Assembled::Incomplete)
                }
            }

            (Stage::Field { head, mut value }, Event::BodyChunk(chunk)) => {
                if value.len() + chunk.len() > self.max_field_bytes {
                    return Err(Error::FieldTooLarge {
                        name: head.name,
                        limit: self.max_field_bytes,
                    });
                }
                value.extend_from_slice(&chunk);
                (Stage::Field { head, value }, Assembled::Incomplete)
            }

            (Stage::Field { head, value }, Event::PartEnd) => {
                let field = FormFieldPart::decode(head, &value)?;
                (Stage::Boundary, Assembled::Field(field))
            }

            (Stage::File, Event::BodyChunk(chunk)) => (Stage::File, Assembled::FileChunk(chunk)),

            (Stage::File, Event::PartEnd) => (Stage::Boundary, Assembled::FileEnd),

            (Stage::Finished, _) => (Stage::Finished, Assembled::End),

            (stage, event) => {
                return Err(Error::malformed(format!(
                    "unexpected {:?} while {}",
                    event,
                    stage.describe()
                )))
            }
        };

        self.stage = next;
        Ok(out)
    }
}
