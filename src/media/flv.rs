//! FLV-tag payload sniffing
//!
//! RTMP audio/video payloads carry the FLV tag body layout. The streaming
//! plane only needs three facts about a payload: is it a video key frame,
//! and is it an AVC or AAC sequence header (the one-shot decoder configs a
//! late joiner must receive before media frames).

/// Video frame type: key frame (first nibble 1)
const VIDEO_FRAME_KEY: u8 = 1;

/// Video codec id: AVC / H.264 (second nibble 7)
const VIDEO_CODEC_AVC: u8 = 7;

/// AVC packet type 0: sequence header (AVCDecoderConfigurationRecord)
const AVC_SEQUENCE_HEADER: u8 = 0;

/// Audio codec id: AAC (first nibble 10)
const AUDIO_CODEC_AAC: u8 = 10;

/// AAC packet type 0: sequence header (AudioSpecificConfig)
const AAC_SEQUENCE_HEADER: u8 = 0;

/// True when the video payload starts a key frame (sequence headers count)
pub fn is_video_keyframe(payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] >> 4) == VIDEO_FRAME_KEY
}

/// True for an H.264 SPS/PPS sequence header payload
pub fn is_video_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2
        && (payload[0] >> 4) == VIDEO_FRAME_KEY
        && (payload[0] & 0x0F) == VIDEO_CODEC_AVC
        && payload[1] == AVC_SEQUENCE_HEADER
}

/// True for an AAC SpecificConfig sequence header payload
pub fn is_audio_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2
        && (payload[0] >> 4) == AUDIO_CODEC_AAC
        && payload[1] == AAC_SEQUENCE_HEADER
}
