use futures_util::StreamExt;
use observable::{Observable, Tracker};

#[tokio::main]
async fn main() {
    // Create the observable container for our u32s.
    let observable = Observable::new(0);
    // Create a tracker that waits for changes to the stored value.
    let tracker = observable.track();
    // Spawn a background worker that will print out the values it reads.
    let tracking_task = tokio::task::spawn(tracking_task(tracker));

    // Send a sequence of numbers, ending at 1,000.
    for i in 1..=1000 {
        observable.replace(i);
    }

    // Once we're done sending values, dropping the Observable will ensure
    // trackers are notified of the disconnection. Trackers are guaranteed to
    // be able to read the final value.
    drop(observable);

    // Wait for the task to exit.
    tracking_task.await.unwrap();
}

async fn tracking_task(tracker: Tracker<u32>) {
    // A Tracker can be converted into a Stream, which allows for asynchronous
    // iteration.
    let mut stream = tracker.into_stream();
    while let Some(value) = stream.next().await {
        // The value we received will not necessarily be sequential, even
        // though the main task is publishing a complete sequence.
        println!("Read value: {value}");
    }
}

#[test]
fn runs() {
    main()
}
