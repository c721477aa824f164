pub mod framing;
pub mod protocol;

pub use framing::{
    decode_line, encode_line, DecodeReport, FrameError, NdjsonDecoder, DEFAULT_MAX_FRAME_BYTES,
};
pub use protocol::{
    now_rfc3339, AnswerSource, CheckboxConfig, ConfirmConfig, InputConfig, PrefixSelectConfig,
    PromptAnsweredMessage, PromptChoice, PromptKind, PromptPayload, PromptRequestMessage,
    PromptResponseMessage, SelectConfig, StructuredMessage,
};
