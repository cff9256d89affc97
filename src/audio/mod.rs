pub mod buffer;
pub mod crossfade;
pub mod gate;
pub mod processor;

pub use buffer::{align_to_hop, AudioWindow, RollingAudioBuffer, PCM_SCALE};
pub use crossfade::blend;
pub use gate::{compute_rms, gate, GateConfig, GateDecision};
pub use processor::{duration_ms, from_pcm16, load_wav, resample, to_pcm16, write_wav};
