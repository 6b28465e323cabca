use pianolane_core::{
    AudioEngine, OscillatorBank, Sequencer,
    export::{export_wav, write_midi},
    fixtures::{demo_file, multi_channel_bytes},
};

#[test]
fn midi_and_wav_exports_generate_output() {
    let sample_rate = 8_000;
    let mut engine = AudioEngine::offline(sample_rate, Box::new(OscillatorBank::new(sample_rate)));
    let mut sequencer = Sequencer::default();
    sequencer
        .load_bytes(&multi_channel_bytes())
        .expect("fixture should load");
    sequencer
        .generate(&mut engine, 1.0)
        .expect("generate should work");

    let temp_dir = tempfile::tempdir().expect("tempdir should work");
    let midi_path = temp_dir.path().join("smoke.mid");
    let wav_path = temp_dir.path().join("smoke.wav");

    write_midi(&demo_file(), &midi_path).expect("midi export should succeed");
    let frames =
        export_wav(sequencer.tracks(), sample_rate, &wav_path).expect("wav export should succeed");
    assert_eq!(frames * 2, sequencer.max_sample_count());

    let midi_size = std::fs::metadata(&midi_path)
        .expect("midi metadata must exist")
        .len();
    assert!(midi_size > 14, "midi file should hold more than its header");

    let reader = hound::WavReader::open(&wav_path).expect("wav should open");
    assert_eq!(reader.spec().sample_rate, sample_rate);
    assert_eq!(reader.spec().bits_per_sample, 16);
    assert_eq!(reader.duration() as usize, frames);
}
