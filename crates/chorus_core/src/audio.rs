//! Audio inspection helpers

use std::io::Cursor;
use std::time::Duration;

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Length of a WAV clip, from the frame count and time base of its first track.
///
/// Returns `None` when the bytes can't be read as WAV or the header carries
/// no length.
pub fn wav_duration(bytes: &[u8]) -> Option<Duration> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("wav");

    let reader = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?
        .format;
    let track = reader.default_track()?;
    let frames = track.codec_params.n_frames?;
    let time = track.codec_params.time_base?.calc_time(frames);

    Some(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac))
}
